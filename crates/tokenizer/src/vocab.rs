use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Result, TokenizerError};

/// Character-level vocabulary: the sorted distinct characters of a text,
/// each mapped to its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<char>", into = "Vec<char>")]
pub struct CharVocab {
    id_to_char: Vec<char>,
    char_to_id: HashMap<char, i64>,
}

impl CharVocab {
    pub fn from_text(text: &str) -> Self {
        let chars: BTreeSet<char> = text.chars().collect();
        Self::from_sorted(chars.into_iter().collect())
    }

    fn from_sorted(id_to_char: Vec<char>) -> Self {
        let char_to_id = id_to_char
            .iter()
            .enumerate()
            .map(|(id, &c)| (c, id as i64))
            .collect();
        Self {
            id_to_char,
            char_to_id,
        }
    }

    pub fn len(&self) -> usize {
        self.id_to_char.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_char.is_empty()
    }

    pub fn get_id(&self, c: char) -> Option<i64> {
        self.char_to_id.get(&c).copied()
    }

    pub fn get_char(&self, id: i64) -> Option<char> {
        usize::try_from(id).ok().and_then(|i| self.id_to_char.get(i)).copied()
    }

    /// Fails on the first character outside the vocabulary.
    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        text.chars()
            .map(|c| self.get_id(c).ok_or(TokenizerError::TokenNotFound(c)))
            .collect()
    }

    pub fn decode(&self, ids: &[i64]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                self.get_char(id).ok_or(TokenizerError::IdOutOfRange {
                    id,
                    size: self.len(),
                })
            })
            .collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl TryFrom<Vec<char>> for CharVocab {
    type Error = TokenizerError;

    fn try_from(chars: Vec<char>) -> Result<Self> {
        if chars.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(TokenizerError::VocabMismatch(
                "characters must be sorted and distinct".to_string(),
            ));
        }
        Ok(Self::from_sorted(chars))
    }
}

impl From<CharVocab> for Vec<char> {
    fn from(vocab: CharVocab) -> Self {
        vocab.id_to_char
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_sorted_characters() {
        let vocab = CharVocab::from_text("hello world");
        assert_eq!(vocab.len(), 8);
        assert_eq!(vocab.get_id(' '), Some(0));
        assert_eq!(vocab.get_id('d'), Some(1));
        assert_eq!(vocab.get_id('w'), Some(7));
        assert_eq!(vocab.get_char(2), Some('e'));
        assert_eq!(vocab.get_char(8), None);
        assert_eq!(vocab.get_char(-1), None);
    }

    #[test]
    fn encode_then_decode_restores_text() {
        let vocab = CharVocab::from_text("O God, O God!");
        let ids = vocab.encode("God, O!").unwrap();
        assert_eq!(vocab.decode(&ids).unwrap(), "God, O!");
    }

    #[test]
    fn unseen_characters_are_errors() {
        let vocab = CharVocab::from_text("abc");
        assert!(matches!(vocab.encode("abz"), Err(TokenizerError::TokenNotFound('z'))));
        assert!(matches!(
            vocab.decode(&[0, 3]),
            Err(TokenizerError::IdOutOfRange { id: 3, size: 3 })
        ));
    }

    #[test]
    fn stored_vocabulary_must_be_sorted() {
        assert!(serde_json::from_str::<CharVocab>(r#"["a","b"]"#).is_ok());
        assert!(serde_json::from_str::<CharVocab>(r#"["b","a"]"#).is_err());
        assert!(serde_json::from_str::<CharVocab>(r#"["a","a"]"#).is_err());
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir().join(format!("tinylm-vocab-{}.json", std::process::id()));
        let vocab = CharVocab::from_text("to be or not");
        vocab.save(&path).unwrap();
        assert_eq!(CharVocab::load(&path).unwrap(), vocab);
        std::fs::remove_file(path).unwrap();
    }
}
