//! Locale detection from request paths.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocaleError {
    #[error("default locale must not be empty")]
    EmptyDefault,
    #[error("default locale `{0}` is not in the supported list")]
    UnsupportedDefault(String),
}

/// The set of locales a deployment serves, plus the one used when a path names none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleSet {
    default: String,
    supported: Vec<String>,
}

impl LocaleSet {
    pub fn new(
        default: impl Into<String>,
        supported: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, LocaleError> {
        let default = default.into().trim().to_string();
        if default.is_empty() {
            return Err(LocaleError::EmptyDefault);
        }

        let mut list: Vec<String> = Vec::new();
        for locale in supported {
            let locale = locale.into().trim().to_string();
            if !locale.is_empty() && !list.iter().any(|known| known.eq_ignore_ascii_case(&locale))
            {
                list.push(locale);
            }
        }

        if list.is_empty() {
            list.push(default.clone());
        } else if !list.iter().any(|known| known.eq_ignore_ascii_case(&default)) {
            return Err(LocaleError::UnsupportedDefault(default));
        }

        Ok(Self {
            default,
            supported: list,
        })
    }

    pub fn default_locale(&self) -> &str {
        &self.default
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    /// Returns the configured spelling of `candidate` when it is supported.
    pub fn normalize(&self, candidate: &str) -> Option<&str> {
        self.supported
            .iter()
            .find(|known| known.eq_ignore_ascii_case(candidate))
            .map(String::as_str)
    }

    /// Locale named by the first path segment, or the default.
    pub fn from_path(&self, path: &str) -> &str {
        path.trim_matches('/')
            .split('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .and_then(|segment| self.normalize(segment))
            .unwrap_or(&self.default)
    }
}

impl Default for LocaleSet {
    fn default() -> Self {
        Self {
            default: "en".to_string(),
            supported: vec!["en".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locales() -> LocaleSet {
        LocaleSet::new("en", ["en", "zh", "pt-BR"]).expect("valid locales")
    }

    #[test]
    fn first_segment_selects_supported_locale() {
        let set = locales();
        assert_eq!(set.from_path("/zh/docs"), "zh");
        assert_eq!(set.from_path("/pt-br"), "pt-BR");
    }

    #[test]
    fn unknown_or_missing_segment_uses_default() {
        let set = locales();
        assert_eq!(set.from_path("/"), "en");
        assert_eq!(set.from_path(""), "en");
        assert_eq!(set.from_path("/fr/docs"), "en");
        assert_eq!(set.from_path("/posts/zh"), "en");
    }

    #[test]
    fn default_must_be_supported() {
        assert_eq!(
            LocaleSet::new("fr", ["en"]),
            Err(LocaleError::UnsupportedDefault("fr".to_string()))
        );
        assert_eq!(LocaleSet::new(" ", ["en"]), Err(LocaleError::EmptyDefault));
    }

    #[test]
    fn empty_supported_list_falls_back_to_default() {
        let set = LocaleSet::new("de", Vec::<String>::new()).expect("valid locales");
        assert_eq!(set.supported(), ["de".to_string()]);
    }
}
