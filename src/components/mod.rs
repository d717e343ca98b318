//! Components that live in forms and tasks

pub mod translate;

pub use translate::{HttpTranslationService, TranslationService, Translator};
