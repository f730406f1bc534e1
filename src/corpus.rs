use either::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use crate::error::{Error, Result};

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(BufReader::new(file))
}

/// Term strings for printing. Without a vocabulary file terms are their ids.
#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    terms: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// One term per line; the line number is the id.
    pub fn read(path: &Path) -> Result<Self> {
        let reader = open(path)?;
        let mut vocabulary = Vocabulary::new();
        for line in reader.lines() {
            let l = line.map_err(|e| Error::io(path, e))?;
            vocabulary.add_term(l.trim().to_owned());
        }
        Ok(vocabulary)
    }

    pub fn add_term(&mut self, term: String) -> u32 {
        let id = self.terms.len() as u32;
        self.index.entry(term.clone()).or_insert(id);
        self.terms.push(term);
        id
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn term(&self, id: u32) -> String {
        match self.terms.get(id as usize) {
            Some(t) => t.clone(),
            None => id.to_string(),
        }
    }

    pub fn id(&self, term: &str) -> Option<u32> {
        self.index.get(term).cloned()
    }
}

/// Stopwords and synonyms applied while reading a corpus.
#[derive(Clone, Debug, Default)]
pub struct TermMapping {
    // None drops the term
    map: HashMap<u32, Option<u32>>,
}

impl TermMapping {
    /// Each line is `term` (a stopword) or `term target` (a synonym). Terms are
    /// ids, or names when a vocabulary is given. `#` starts a comment.
    pub fn read(path: &Path, vocabulary: Option<&Vocabulary>) -> Result<Self> {
        let reader = open(path)?;
        let mut mapping = TermMapping::default();
        for (i, line) in reader.lines().enumerate() {
            let l = line.map_err(|e| Error::io(path, e))?;
            let content = match l.find('#') {
                Some(pos) => &l[..pos],
                None => &l[..],
            };
            let fields: Vec<&str> = content.split_whitespace().collect();
            let resolve = |field: &str| -> Result<u32> {
                let term = match field.parse::<u32>() {
                    Ok(id) => Left(id),
                    Err(_) => Right(field),
                };
                match term {
                    Left(id) => Ok(id),
                    Right(name) => vocabulary.and_then(|v| v.id(name)).ok_or_else(|| {
                        Error::parse(path, i + 1, format!("unknown term {:?}", name))
                    }),
                }
            };
            match fields.len() {
                0 => continue,
                1 => {
                    mapping.map.insert(resolve(fields[0])?, None);
                }
                2 => {
                    mapping
                        .map
                        .insert(resolve(fields[0])?, Some(resolve(fields[1])?));
                }
                _ => {
                    return Err(Error::parse(
                        path,
                        i + 1,
                        "expected `term` or `term synonym`",
                    ))
                }
            }
        }
        Ok(mapping)
    }

    pub fn insert(&mut self, term: u32, target: Option<u32>) {
        self.map.insert(term, target);
    }

    /// The id a term is counted as, or None for a stopword.
    pub fn apply(&self, id: u32) -> Option<u32> {
        match self.map.get(&id) {
            Some(&target) => target,
            None => Some(id),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    pub words: Vec<u32>,
}

impl Document {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Corpus {
    pub documents: Vec<Document>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: Vec<Vec<u32>>) -> Self {
        Self {
            documents: documents
                .into_iter()
                .map(|words| Document { words: words })
                .collect(),
        }
    }

    /// Read LDA-C: one document per line, `N id:count ... id:count` with N the
    /// number of pairs. Tokens are laid out in file order; a blank line or a
    /// lone `0` is a zero-length document.
    pub fn read_ldac(path: &Path, mapping: Option<&TermMapping>) -> Result<Self> {
        let reader = open(path)?;
        let mut corpus = Corpus::new();
        for (i, line) in reader.lines().enumerate() {
            let l = line.map_err(|e| Error::io(path, e))?;
            let words = parse_ldac_line(&l).map_err(|msg| Error::parse(path, i + 1, msg))?;
            let words = match mapping {
                Some(m) => words.into_iter().filter_map(|w| m.apply(w)).collect(),
                None => words,
            };
            corpus.documents.push(Document { words: words });
        }
        Ok(corpus)
    }

    pub fn num_documents(&self) -> usize {
        self.documents.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.documents.iter().map(|d| d.len()).sum()
    }

    /// One past the largest term id, 0 for a corpus without tokens.
    pub fn id_bound(&self) -> usize {
        self.documents
            .iter()
            .flat_map(|d| d.words.iter())
            .map(|&w| w as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

fn parse_ldac_line(line: &str) -> std::result::Result<Vec<u32>, String> {
    let mut fields = line.split_whitespace();
    let declared = match fields.next() {
        None => return Ok(Vec::new()),
        Some(f) => f
            .parse::<usize>()
            .map_err(|_| format!("bad term count {:?}", f))?,
    };
    let mut words = Vec::new();
    let mut pairs = 0;
    for field in fields {
        let mut parts = field.splitn(2, ':');
        let id = parts.next().and_then(|s| s.parse::<u32>().ok());
        let count = parts.next().and_then(|s| s.parse::<u32>().ok());
        match (id, count) {
            (Some(id), Some(count)) => {
                for _ in 0..count {
                    words.push(id);
                }
            }
            _ => return Err(format!("bad pair {:?}, expected id:count", field)),
        }
        pairs += 1;
    }
    if pairs != declared {
        return Err(format!("line declares {} terms but has {}", declared, pairs));
    }
    Ok(words)
}

/// Group id per document, one integer per line, ids from 0.
pub fn read_groups(path: &Path, num_documents: usize) -> Result<Vec<usize>> {
    let reader = open(path)?;
    let mut groups = Vec::with_capacity(num_documents);
    for (i, line) in reader.lines().enumerate() {
        let l = line.map_err(|e| Error::io(path, e))?;
        let l = l.trim();
        if l.is_empty() {
            continue;
        }
        let g = l
            .parse::<usize>()
            .map_err(|_| Error::parse(path, i + 1, format!("bad group id {:?}", l)))?;
        groups.push(g);
    }
    if groups.len() != num_documents {
        return Err(Error::parse(
            path,
            groups.len(),
            format!("{} group ids for {} documents", groups.len(), num_documents),
        ));
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn reads_ldac_with_empty_documents() {
        let f = file_with("2 0:2 3:1\n0\n1 1:1\n");
        let corpus = Corpus::read_ldac(f.path(), None).unwrap();
        assert_eq!(corpus.num_documents(), 3);
        assert_eq!(corpus.documents[0].words, vec![0, 0, 3]);
        assert!(corpus.documents[1].is_empty());
        assert_eq!(corpus.num_tokens(), 4);
        assert_eq!(corpus.id_bound(), 4);
    }

    #[test]
    fn malformed_lines_report_their_position() {
        let f = file_with("1 0:1\n2 4:1\n");
        match Corpus::read_ldac(f.path(), None) {
            Err(Error::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        let f = file_with("1 x:1\n");
        assert!(Corpus::read_ldac(f.path(), None).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Corpus::read_ldac(Path::new("/nonexistent/dir/c.ldac"), None).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn mapping_drops_stopwords_and_merges_synonyms() {
        let mut vocabulary = Vocabulary::new();
        for t in &["the", "car", "auto", "road"] {
            vocabulary.add_term(t.to_string());
        }
        let m = file_with("# stopwords\nthe\nauto car   # synonym\n3 1\n");
        let mapping = TermMapping::read(m.path(), Some(&vocabulary)).unwrap();
        assert_eq!(mapping.len(), 3);
        let f = file_with("4 0:1 1:1 2:2 3:1\n");
        let corpus = Corpus::read_ldac(f.path(), Some(&mapping)).unwrap();
        assert_eq!(corpus.documents[0].words, vec![1, 1, 1, 1]);

        let bad = file_with("lorry\n");
        assert!(TermMapping::read(bad.path(), Some(&vocabulary)).is_err());
    }

    #[test]
    fn groups_must_cover_every_document() {
        let g = file_with("0\n1\n1\n");
        assert_eq!(read_groups(g.path(), 3).unwrap(), vec![0, 1, 1]);
        assert!(read_groups(g.path(), 4).is_err());
    }

    #[test]
    fn vocabulary_falls_back_to_ids() {
        let v = file_with("alpha\nbeta\n");
        let vocabulary = Vocabulary::read(v.path()).unwrap();
        assert_eq!(vocabulary.term(1), "beta");
        assert_eq!(vocabulary.term(7), "7");
        assert_eq!(vocabulary.id("alpha"), Some(0));
    }
}
