use regex::Regex;

/// Replaces registered secret values with `****` before a line reaches the
/// terminal. Alphanumeric/underscore secrets are matched on word
/// boundaries; anything with special characters is matched as an exact
/// substring.
#[derive(Debug, Clone, Default)]
pub struct Masker {
    entries: Vec<MaskEntry>,
}

#[derive(Debug, Clone)]
enum MaskEntry {
    Word(Regex),
    Plain(String),
}

const MASKED: &str = "****";

impl Masker {
    pub fn empty() -> Masker {
        Masker {
            entries: Vec::new(),
        }
    }

    pub fn new(secrets: &[String]) -> Masker {
        let mut m = Masker::empty();
        m.add(secrets);
        m
    }

    /// Empty and whitespace-only secrets are ignored, they would otherwise
    /// mangle every line.
    pub fn add(&mut self, secrets: &[String]) {
        for s in secrets {
            if s.is_empty() || s.trim().is_empty() {
                continue;
            }
            if self.contains(s) {
                continue;
            }
            if is_word(s) {
                let re = Regex::new(&format!(r"\b{}\b", regex::escape(s)))
                    .expect("escaped secret is a valid pattern");
                self.entries.push(MaskEntry::Word(re));
            } else {
                self.entries.push(MaskEntry::Plain(s.clone()));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&self, line: &str) -> String {
        let mut res = line.to_string();
        for e in &self.entries {
            match e {
                MaskEntry::Word(re) => {
                    res = re.replace_all(&res, MASKED).into_owned();
                }
                MaskEntry::Plain(s) => {
                    res = res.replace(s.as_str(), MASKED);
                }
            }
        }
        res
    }

    fn contains(&self, secret: &str) -> bool {
        self.entries.iter().any(|e| match e {
            MaskEntry::Word(re) => re.as_str() == format!(r"\b{}\b", regex::escape(secret)),
            MaskEntry::Plain(s) => s == secret,
        })
    }
}

fn is_word(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
