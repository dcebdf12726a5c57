// ISO/IEC 7816-4, 5.6 Status bytes
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const FUNCTION_NOT_SUPPORTED: StatusWord = StatusWord(0x6A81);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    pub const RECORD_NOT_FOUND: StatusWord = StatusWord(0x6A83);
    pub const REFERENCED_DATA_NOT_FOUND: StatusWord = StatusWord(0x6A88);

    pub fn new(sw1: u8, sw2: u8) -> StatusWord {
        StatusWord((sw1 as u16) << 8 | sw2 as u16)
    }

    /// Status word from the last two bytes of a response.
    pub fn from_trailer(response: &[u8]) -> Option<StatusWord> {
        match response {
            [.., sw1, sw2] => Some(StatusWord::new(*sw1, *sw2)),
            _ => None,
        }
    }

    pub fn sw1(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        self.0 as u8
    }

    pub fn is_success(&self) -> bool {
        *self == StatusWord::SUCCESS
    }

    pub fn category(&self) -> StatusCategory {
        match self.sw1() {
            0x90 if self.sw2() == 0x00 => StatusCategory::Success,
            0x61 => StatusCategory::MoreDataAvailable,
            0x6C => StatusCategory::WrongLength,
            0x62 | 0x63 => StatusCategory::Warning,
            0x64 | 0x65 | 0x66 => StatusCategory::ExecutionError,
            0x69 => StatusCategory::ConditionsNotSatisfied,
            0x6A => StatusCategory::NotFound,
            0x67 | 0x68 | 0x6B | 0x6D | 0x6E | 0x6F => StatusCategory::CheckingError,
            _ => StatusCategory::Unknown,
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCategory {
    Success,
    MoreDataAvailable,
    WrongLength,
    Warning,
    ExecutionError,
    ConditionsNotSatisfied,
    NotFound,
    CheckingError,
    Unknown,
}

impl StatusCategory {
    /// 69xx and 6Axx: the card lacks the object or refuses it in this state.
    /// Expected while probing optional data, never treated as an error.
    pub fn is_feature_absent(&self) -> bool {
        matches!(
            self,
            StatusCategory::ConditionsNotSatisfied | StatusCategory::NotFound
        )
    }
}

/// Human readable descriptions for status words, keyed by the four hex
/// digits (`"6A82"`) or by SW1 alone (`"61"`) for families.
pub struct StatusWordCatalog {
    descriptions: HashMap<String, String>,
}

impl StatusWordCatalog {
    pub fn new(descriptions: HashMap<String, String>) -> StatusWordCatalog {
        StatusWordCatalog {
            descriptions: descriptions
                .into_iter()
                .map(|(code, description)| (code.to_uppercase(), description))
                .collect(),
        }
    }

    pub fn describe(&self, status: StatusWord) -> String {
        let code = status.to_string();

        if let Some(description) = self.descriptions.get(&code) {
            format!("{} - {}", code, description)
        } else if let Some(description) = self.descriptions.get(&code[0..2]) {
            format!("{} - {}", code, description)
        } else {
            code
        }
    }

    pub fn classify(&self, status: StatusWord) -> StatusCategory {
        status.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StatusWordCatalog {
        let mut descriptions = HashMap::new();
        descriptions.insert("9000".to_string(), "Command successfully executed (OK).".to_string());
        descriptions.insert("6a82".to_string(), "File not found".to_string());
        descriptions.insert("61".to_string(), "Response bytes still available".to_string());

        StatusWordCatalog::new(descriptions)
    }

    #[test]
    fn test_status_word_from_trailer() {
        assert_eq!(
            StatusWord::from_trailer(&[0x6F, 0x00, 0x90, 0x00]),
            Some(StatusWord::SUCCESS)
        );
        assert_eq!(StatusWord::from_trailer(&[0x90]), None);

        let sw = StatusWord::new(0x61, 0x1C);
        assert_eq!(sw.sw1(), 0x61);
        assert_eq!(sw.sw2(), 0x1C);
        assert_eq!(sw.to_string(), "611C");
    }

    #[test]
    fn test_describe_falls_back_to_sw1_family() {
        let catalog = catalog();

        assert_eq!(catalog.describe(StatusWord::FILE_NOT_FOUND), "6A82 - File not found");
        assert_eq!(
            catalog.describe(StatusWord(0x6110)),
            "6110 - Response bytes still available"
        );
        assert_eq!(catalog.describe(StatusWord(0x6F00)), "6F00");
    }

    #[test]
    fn test_classification() {
        let catalog = catalog();

        assert_eq!(catalog.classify(StatusWord::SUCCESS), StatusCategory::Success);
        assert_eq!(catalog.classify(StatusWord(0x9001)), StatusCategory::Unknown);
        assert_eq!(catalog.classify(StatusWord(0x6C10)), StatusCategory::WrongLength);
        assert_eq!(catalog.classify(StatusWord(0x6283)), StatusCategory::Warning);
        assert_eq!(catalog.classify(StatusWord(0x6D00)), StatusCategory::CheckingError);

        for absent in [
            StatusWord::CONDITIONS_NOT_SATISFIED,
            StatusWord::FUNCTION_NOT_SUPPORTED,
            StatusWord::FILE_NOT_FOUND,
            StatusWord::RECORD_NOT_FOUND,
            StatusWord::REFERENCED_DATA_NOT_FOUND,
        ] {
            assert!(catalog.classify(absent).is_feature_absent(), "{}", absent);
        }

        assert!(!catalog.classify(StatusWord::WRONG_LENGTH).is_feature_absent());
    }
}
