use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::store::{Flag, Store};

const RTL_LANGUAGES: &[&str] = &["ar", "he", "fa", "ur"];

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TextDirection {
    Ltr,
    Rtl,
}

impl TextDirection {
    fn as_str(self) -> &'static str {
        match self {
            TextDirection::Ltr => "ltr",
            TextDirection::Rtl => "rtl",
        }
    }

    fn for_language(language: &str) -> TextDirection {
        if RTL_LANGUAGES.contains(&language) {
            TextDirection::Rtl
        } else {
            TextDirection::Ltr
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Preferences {
    pub language: String,
    pub direction: TextDirection,
}

impl Preferences {
    /// English, left to right, unless something else was saved.
    pub fn load(store: &Store) -> Preferences {
        let language = store.flag(Flag::Language).unwrap_or_else(|| "en".into());
        let direction = match store.flag(Flag::Direction).as_deref() {
            Some("rtl") => TextDirection::Rtl,
            Some("ltr") => TextDirection::Ltr,
            _ => TextDirection::for_language(&language),
        };

        Preferences {
            language,
            direction,
        }
    }

    fn save(&self, store: &Store) -> Result<(), StorageError> {
        store.set_flag(Flag::Language, &self.language)?;
        store.set_flag(Flag::Direction, self.direction.as_str())
    }

    /// Switches language and picks the direction that goes with it.
    pub fn set_language(store: &Store, language: &str) -> Result<Preferences, StorageError> {
        let preferences = Preferences {
            language: language.into(),
            direction: TextDirection::for_language(language),
        };
        preferences.save(store)?;
        Ok(preferences)
    }

    pub fn toggle_direction(store: &Store) -> Result<Preferences, StorageError> {
        let mut preferences = Preferences::load(store);
        preferences.direction = match preferences.direction {
            TextDirection::Ltr => TextDirection::Rtl,
            TextDirection::Rtl => TextDirection::Ltr,
        };
        preferences.save(store)?;
        Ok(preferences)
    }
}

/// True for text containing Arabic or Hebrew script.
pub fn is_rtl_text(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c,
            '\u{0590}'..='\u{05FF}'
            | '\u{0600}'..='\u{06FF}'
            | '\u{0750}'..='\u{077F}'
            | '\u{08A0}'..='\u{08FF}')
    })
}
