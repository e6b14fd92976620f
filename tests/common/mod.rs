#![allow(dead_code)]

use lodestone::indexing::discovery::{ScanRules, ScannedFile};
use lodestone::{
    Config, Domain, DomainConfig, EmbeddingProvider, Error, Result, Scanner, TermExtractor, Tokenizer, WalkScanner,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

/// A project directory plus a separate lodestone base directory.
pub struct Fixture {
    _temp: TempDir,
    pub root: PathBuf,
    pub base: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("project");
        let base = temp.path().join("lodestone");
        fs::create_dir_all(&root).unwrap();
        Self {
            _temp: temp,
            root,
            base,
        }
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn config(&self, domain: Domain) -> Config {
        Config::new(Some(self.base.clone()))
            .unwrap()
            .with_domain(domain, DomainConfig::new(&self.root))
    }
}

/// Move a file's modification time `secs` seconds into the future.
pub fn bump_mtime(path: &Path, secs: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .unwrap();
}

/// The real tokenizer, recording every text it is asked to tokenize.
#[derive(Default)]
pub struct RecordingTokenizer {
    inner: Tokenizer,
    pub seen: Mutex<Vec<String>>,
}

impl RecordingTokenizer {
    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.seen.lock().unwrap().iter().any(|t| t.contains(needle))
    }
}

impl TermExtractor for RecordingTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        self.seen.lock().unwrap().push(text.to_string());
        self.inner.tokenize(text)
    }
}

/// The real tokenizer, panicking on any text containing `POISON`.
#[derive(Default)]
pub struct PoisonTokenizer {
    inner: Tokenizer,
}

impl TermExtractor for PoisonTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        if text.contains("POISON") {
            panic!("cannot tokenize poisoned text");
        }
        self.inner.tokenize(text)
    }
}

/// The real tokenizer, stalling on any text containing `HOLD` until
/// `release` is called (or ten seconds pass).
#[derive(Default)]
pub struct GatedTokenizer {
    inner: Tokenizer,
    held: AtomicBool,
    released: AtomicBool,
}

impl GatedTokenizer {
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl TermExtractor for GatedTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        if text.contains("HOLD") {
            self.held.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(10);
            while !self.released.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.inner.tokenize(text)
    }
}

/// Walks normally until `break_next` is set, then fails one scan with an
/// I/O error.
#[derive(Default)]
pub struct FlakyScanner {
    broken: AtomicBool,
}

impl FlakyScanner {
    pub fn break_next(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Scanner for FlakyScanner {
    fn scan(&self, root: &Path, rules: &ScanRules) -> Result<Vec<ScannedFile>> {
        if self.broken.swap(false, Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk went away")));
        }
        WalkScanner.scan(root, rules)
    }
}

/// Three-dimensional "topic" embeddings: vehicles, fruit, everything else.
/// Fails any batch containing the text `FAIL`.
pub struct TopicProvider;

impl EmbeddingProvider for TopicProvider {
    fn dimensions(&self) -> usize {
        3
    }

    fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("FAIL")) {
            return Err(Error::Model("provider rejected the batch".to_string()));
        }
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                if t.contains("car") || t.contains("automobile") {
                    vec![1.0, 0.0, 0.0]
                } else if t.contains("apple") || t.contains("fruit") {
                    vec![0.0, 1.0, 0.0]
                } else {
                    vec![0.0, 0.0, 1.0]
                }
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        "test/topics"
    }
}
