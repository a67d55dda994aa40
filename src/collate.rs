//! Locale-aware sort keys and alphabetic index buckets on top of the ICU
//! collator.
//!
//! Sort keys are ICU collation keys written as lower-case hex, so SQLite can
//! sort and range-scan them with its default BINARY collation. Record keys
//! use the locale's default (tertiary) strength; bucket keys use primary
//! strength, which makes them sort below every word of their bucket.
//!
//! ICU4X has no alphabetic index. The buckets are the base alphabet of the
//! locale's script plus the letters and digraphs that the locale's tailoring
//! moves out of the bucket they occupy in the root collation (Swedish Å Ä Ö
//! after Z, Czech CH after H, Spanish Ñ after N).

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use icu::collator::options::{CollatorOptions, Strength};
use icu::collator::{Collator as IcuCollator, CollatorBorrowed};
use icu::locale::subtags::script;
use icu::locale::{locale, Locale, LocaleExpander};

use crate::error::{CacheError, Result};

const LATIN_BASE: &[&str] = &[
    "A", "B", "C", "D", "E", "F", "G", "H", "I", "J", "K", "L", "M", "N", "O", "P", "Q", "R", "S",
    "T", "U", "V", "W", "X", "Y", "Z",
];

const LATIN_EXTRA: &[&str] = &[
    "Å", "Ä", "Ö", "Ø", "Æ", "Ü", "Õ", "Ñ", "Ç", "Č", "Ć", "Ď", "Ě", "Ğ", "İ", "Ł", "Ň", "Ř", "Ş",
    "Š", "Ť", "Ů", "Ž", "Þ", "CH", "CS", "DZ", "DŽ", "GY", "LJ", "LL", "LY", "NJ", "NY", "SZ", "TY",
    "ZS",
];

const CYRILLIC_BASE: &[&str] = &[
    "А", "Б", "В", "Г", "Д", "Е", "Ж", "З", "И", "Й", "К", "Л", "М", "Н", "О", "П", "Р", "С", "Т",
    "У", "Ф", "Х", "Ц", "Ч", "Ш", "Щ", "Ы", "Э", "Ю", "Я",
];

const CYRILLIC_EXTRA: &[&str] = &["Ё", "Ґ", "Є", "І", "Ї", "Ў", "Ј", "Љ", "Њ", "Ћ", "Џ"];

const GREEK_BASE: &[&str] = &[
    "Α", "Β", "Γ", "Δ", "Ε", "Ζ", "Η", "Θ", "Ι", "Κ", "Λ", "Μ", "Ν", "Ξ", "Ο", "Π", "Ρ", "Σ", "Τ",
    "Υ", "Φ", "Χ", "Ψ", "Ω",
];

/// Translate a POSIX locale name ("sv_SE.UTF-8", "C") into an ICU locale.
pub fn parse_locale(name: &str) -> Locale {
    let tag = name
        .split(['.', '@'])
        .next()
        .unwrap_or_default()
        .trim()
        .replace('_', "-");
    match tag.as_str() {
        "" | "C" | "POSIX" => locale!("en"),
        _ => Locale::try_from_str(&tag).unwrap_or(locale!("en")),
    }
}

fn icu_collator(locale: &Locale, strength: Option<Strength>) -> Result<CollatorBorrowed<'static>> {
    let mut options = CollatorOptions::default();
    options.strength = strength;
    IcuCollator::try_new(locale.into(), options).map_err(|err| {
        CacheError::InvalidArgument(format!("no collation data for locale {}: {}", locale, err))
    })
}

/// Bucket of `candidate` among `base`: the last base letter at or before it,
/// and whether it falls inside that letter's range of words.
fn bucket_of(
    collator: &CollatorBorrowed<'static>,
    base: &[&str],
    candidate: &str,
) -> Option<(usize, bool)> {
    let idx = base
        .iter()
        .rposition(|b| collator.compare(b, candidate) != Ordering::Greater)?;
    // U+FFFF carries the highest primary weight
    let upper_bound = format!("{}\u{FFFF}", base[idx]);
    Some((idx, collator.compare(candidate, &upper_bound) == Ordering::Less))
}

fn build_labels(
    locale: &Locale,
    full: &CollatorBorrowed<'static>,
    primary: &CollatorBorrowed<'static>,
) -> Result<Vec<String>> {
    let mut id = locale.id.clone();
    LocaleExpander::new_common().maximize(&mut id);
    let (base, extra): (&[&str], &[&str]) = match id.script {
        Some(s) if s == script!("Cyrl") => (CYRILLIC_BASE, CYRILLIC_EXTRA),
        Some(s) if s == script!("Grek") => (GREEK_BASE, &[]),
        _ => (LATIN_BASE, LATIN_EXTRA),
    };

    let root = icu_collator(&locale!("und"), Some(Strength::Primary))?;
    let mut labels: Vec<&str> = base.to_vec();
    for &candidate in extra {
        let Some((at, inside)) = bucket_of(primary, base, candidate) else {
            continue;
        };
        if inside {
            continue;
        }
        match bucket_of(&root, base, candidate) {
            Some((root_at, false)) if root_at == at => {}
            _ => labels.push(candidate),
        }
    }

    // variants of one letter keep the one the locale sorts first
    labels.sort_by(|a, b| full.compare(a, b));
    labels.dedup_by(|a, b| primary.compare(a, b) == Ordering::Equal);
    Ok(labels.into_iter().map(str::to_string).collect())
}

fn hex_key(collator: &CollatorBorrowed<'static>, text: &str) -> String {
    let mut key: Vec<u8> = Vec::new();
    // a Vec sink never fails
    let _ = collator.write_sort_key_to(text, &mut key);
    hex::encode(key)
}

/// Collation service for one locale.
#[derive(Clone)]
pub struct Collator {
    locale: String,
    full: Arc<CollatorBorrowed<'static>>,
    primary: Arc<CollatorBorrowed<'static>>,
    labels: Vec<String>,
}

impl fmt::Debug for Collator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collator")
            .field("locale", &self.locale)
            .field("labels", &self.labels)
            .finish()
    }
}

impl Collator {
    pub fn new(locale: &str) -> Result<Self> {
        let parsed = parse_locale(locale);
        let full = icu_collator(&parsed, None)?;
        let primary = icu_collator(&parsed, Some(Strength::Primary))?;
        let labels = build_labels(&parsed, &full, &primary)?;
        Ok(Self {
            locale: locale.to_string(),
            full: Arc::new(full),
            primary: Arc::new(primary),
            labels,
        })
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Labels of the alphabetic index buckets, in sort order.
    pub fn index_labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_labels(&self) -> usize {
        self.labels.len()
    }

    /// Sort key for `text`; byte-wise comparison of two keys gives their
    /// collation order.
    pub fn generate_key(&self, text: &str) -> String {
        hex_key(&self.full, text.trim())
    }

    /// Key that sorts below every word starting with the `index`-th label and
    /// above every word starting with the label before it.
    pub fn generate_key_for_index(&self, index: usize) -> Result<String> {
        let label = self.labels.get(index).ok_or_else(|| {
            CacheError::InvalidArgument(format!(
                "alphabetic index {} out of range for locale {} ({} labels)",
                index,
                self.locale,
                self.labels.len()
            ))
        })?;
        Ok(hex_key(&self.primary, label))
    }

    /// Bucket of the first letter of `text`, if it falls in any bucket.
    pub fn index_of(&self, text: &str) -> Option<usize> {
        let text = text.trim();
        self.labels
            .iter()
            .rposition(|label| self.primary.compare(label, text) != Ordering::Greater)
    }

    /// Compare two strings the way their sort keys compare.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        self.full.compare(a.trim(), b.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collator(locale: &str) -> Collator {
        Collator::new(locale).unwrap()
    }

    #[test]
    fn posix_names_map_to_icu_locales() {
        assert_eq!(parse_locale("en_US.UTF-8").to_string(), "en-US");
        assert_eq!(parse_locale("sv-SE").to_string(), "sv-SE");
        assert_eq!(parse_locale("C").to_string(), "en");
        assert_eq!(parse_locale("").to_string(), "en");
        assert_eq!(parse_locale("not a locale").to_string(), "en");
    }

    #[test]
    fn keys_follow_collation_order() {
        let c = collator("en_US");
        assert!(c.generate_key("adams") < c.generate_key("Brown"));
        assert!(c.generate_key("jose") < c.generate_key("José"));
        assert!(c.generate_key("José") < c.generate_key("Josh"));
        assert!(c.generate_key("Adam") < c.generate_key("Adams"));
        assert!(c.generate_key("42") < c.generate_key("Aaron"));
        for (a, b) in [("Zorn", "Åberg"), ("Miller", "miller"), ("Smith", "Smyth")] {
            assert_eq!(
                c.generate_key(a).cmp(&c.generate_key(b)),
                c.compare(a, b),
                "{a} vs {b}"
            );
        }
    }

    #[test]
    fn english_has_26_buckets() {
        let c = collator("en_US.UTF-8");
        assert_eq!(c.n_labels(), 26);
        assert_eq!(c.index_labels()[12], "M");
        assert_eq!(c.index_of("Miller"), Some(12));
        assert_eq!(c.index_of("ñandu"), Some(13));
        assert_eq!(c.index_of("Åberg"), Some(0));
        assert_eq!(c.index_of("123"), None);
    }

    #[test]
    fn index_key_brackets_the_bucket() {
        let c = collator("en_US");
        let m = c.generate_key_for_index(12).unwrap();
        assert!(c.generate_key("Lyons") < m);
        assert!(m <= c.generate_key("M"));
        assert!(m < c.generate_key("mac"));
        assert!(m < c.generate_key("Mac"));
        assert!(c.generate_key_for_index(26).is_err());
    }

    #[test]
    fn swedish_sorts_a_ring_after_z() {
        let sv = collator("sv_SE");
        assert!(sv.generate_key("Zorn") < sv.generate_key("Åberg"));
        let labels = sv.index_labels();
        assert_eq!(&labels[labels.len() - 3..], ["Å", "Ä", "Ö"]);
        assert_eq!(sv.index_of("Öberg"), Some(labels.len() - 1));

        let en = collator("en_US");
        assert!(en.generate_key("Åberg") < en.generate_key("Zorn"));
    }

    #[test]
    fn czech_ch_is_its_own_letter() {
        let cs = collator("cs_CZ");
        assert!(cs.generate_key("Hruška") < cs.generate_key("Chládek"));
        assert!(cs.generate_key("Cech") < cs.generate_key("Čech"));
        let labels = cs.index_labels();
        let h = labels.iter().position(|l| l == "H").unwrap();
        assert_eq!(labels[h + 1], "CH");
        assert_eq!(cs.index_of("Chládek"), Some(h + 1));
        assert!(labels.iter().any(|l| l == "Ř"));
    }

    #[test]
    fn cyrillic_locales_use_cyrillic_buckets() {
        let ru = collator("ru_RU");
        assert_eq!(ru.index_labels()[0], "А");
        assert_eq!(ru.index_of("Ёлкин"), ru.index_of("Елкин"));
        assert!(ru.generate_key("Абрамов") < ru.generate_key("Яковлев"));
    }

    #[test]
    fn same_locale_same_buckets() {
        let a = collator("de_DE");
        let b = collator("de_DE");
        assert_eq!(a.index_labels(), b.index_labels());
        assert_eq!(a.n_labels(), 26);
        for idx in 0..a.n_labels() {
            assert_eq!(
                a.generate_key_for_index(idx).unwrap(),
                b.generate_key_for_index(idx).unwrap()
            );
        }
    }
}
