//! Topic classification for free-text activity titles.
//!
//! Quiz titles are written by instructors and carry no subject metadata, so
//! the topic is derived from keywords. Rules are checked in order and the
//! first rule with any matching keyword wins; a title matching two rules
//! always lands on the earlier one.
//!
//! ## Normalization
//!
//! Titles and keywords go through the same pipeline before comparison:
//!
//! 1. lower-case
//! 2. Unicode NFD, combining marks dropped (`Organización` -> `organizacion`)
//! 3. punctuation becomes whitespace
//! 4. Spanish articles and `de`/`del` dropped
//! 5. whitespace runs collapse to one space
//!
//! Matching is a substring test on the normalized strings, so
//! `"Tema 5 - Organización Básica del ET"` matches the keyword
//! `"organizacion basica et"`. Single-word keywords of up to
//! [`SHORT_KEYWORD_MAX_CHARS`] characters (acronyms such as `onu` or `otan`)
//! must match a whole word instead: `"Test bonus"` is not about the ONU.

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Label returned when no rule matches
pub const GENERAL_TOPIC: &str = "general";

/// Single-word keywords this short only match whole words
pub const SHORT_KEYWORD_MAX_CHARS: usize = 4;

/// Filler words removed during normalization
const FILLER_WORDS: &[&str] = &["de", "del", "el", "la", "las", "los"];

/// Default syllabus: (canonical topic, keywords)
const DEFAULT_RULES: &[(&str, &[&str])] = &[
    ("Constitución Española", &["constitucion"]),
    ("Defensa Nacional", &["defensa nacional"]),
    ("Régimen Jurídico del Sector Público", &["regimen juridico"]),
    ("Ministerio de Defensa", &["ministerio de defensa"]),
    ("Organización de las FAS", &["organizacion basica fas"]),
    ("Estado Mayor de la Defensa", &["organizacion basica del em"]),
    ("Ejército de Tierra", &["organizacion basica et", "ejercito de tierra"]),
    ("Armada Española", &["organizacion basica armada", "armada espanola"]),
    ("Ejército del Aire", &["organizacion basica ea", "ejercito del aire"]),
    ("Tropa y Marinería", &["tropa y marineria"]),
    ("Carrera Militar", &["carrera militar", "ley carrera"]),
    ("Reales Ordenanzas", &["reales ordenanzas"]),
    ("Derechos y Deberes de los Miembros de las FAS", &["derechos y deberes"]),
    ("Régimen Disciplinario de las Fuerzas Armadas", &["regimen disciplinario", "disciplinario"]),
    ("Tramitación Iniciativas y Quejas", &["iniciativas y quejas"]),
    ("Igualdad Efectiva de Mujeres y Hombres", &["igualdad efectiva"]),
    ("Observatorio Militar para la Igualdad", &["observatorio militar"]),
    ("Procedimiento Administrativo Común", &["procedimiento administrativo"]),
    ("Seguridad Nacional", &["seguridad nacional"]),
    ("Estrategia de Seguridad Nacional", &["estrategia de seguridad"]),
    ("Doctrina", &["doctrina"]),
    ("Organización de las Naciones Unidas", &["naciones unidas", "onu"]),
    ("OTAN", &["otan", "tratado del atlantico norte"]),
    ("OSCE", &["osce", "organizacion para la seguridad y cooperacion en europa"]),
    ("Unión Europea", &["union europea"]),
    ("España y su Participación en Misiones", &["misiones internacionales"]),
];

/// One classification rule as it appears in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRule {
    pub topic: String,
    pub keywords: Vec<String>,
}

/// Rule with its keywords already normalized
#[derive(Debug, Clone)]
struct CompiledRule {
    topic: String,
    keywords: Vec<Keyword>,
}

#[derive(Debug, Clone)]
enum Keyword {
    Word(String),
    Phrase(String),
}

impl Keyword {
    fn compile(raw: &str) -> Option<Self> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            None
        } else if !normalized.contains(' ') && normalized.chars().count() <= SHORT_KEYWORD_MAX_CHARS {
            Some(Keyword::Word(normalized))
        } else {
            Some(Keyword::Phrase(normalized))
        }
    }

    /// `title` must already be normalized
    fn matches(&self, title: &str) -> bool {
        match self {
            Keyword::Word(word) => title.split(' ').any(|w| w == word),
            Keyword::Phrase(phrase) => title.contains(phrase.as_str()),
        }
    }
}

/// Ordered keyword classifier
#[derive(Debug, Clone)]
pub struct TopicClassifier {
    rules: Vec<CompiledRule>,
    fallback: String,
}

impl Default for TopicClassifier {
    fn default() -> Self {
        Self::new(default_rules(), GENERAL_TOPIC)
    }
}

impl TopicClassifier {
    /// Build a classifier from an ordered rule list.
    ///
    /// Keywords that normalize to an empty string are dropped, otherwise they
    /// would match every title.
    pub fn new(rules: Vec<TopicRule>, fallback: impl Into<String>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| CompiledRule {
                keywords: rule
                    .keywords
                    .iter()
                    .filter_map(|k| Keyword::compile(k))
                    .collect(),
                topic: rule.topic,
            })
            .filter(|rule| !rule.keywords.is_empty())
            .collect();

        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    /// Map a raw activity title to its canonical topic
    pub fn classify(&self, raw_title: &str) -> String {
        let title = normalize(raw_title);
        if !title.is_empty() {
            for rule in &self.rules {
                if rule.keywords.iter().any(|k| k.matches(&title)) {
                    return rule.topic.clone();
                }
            }
        }
        self.fallback.clone()
    }

    /// Canonical topics in rule order
    pub fn topics(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.topic.as_str()).collect()
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}

/// The built-in rule table
pub fn default_rules() -> Vec<TopicRule> {
    DEFAULT_RULES
        .iter()
        .map(|(topic, keywords)| TopicRule {
            topic: topic.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        })
        .collect()
}

/// Fold case, accents, punctuation and filler words
pub fn normalize(input: &str) -> String {
    let folded: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded
        .split_whitespace()
        .filter(|word| !FILLER_WORDS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_accents_and_fillers() {
        assert_eq!(normalize("Organización Básica del ET"), "organizacion basica et");
        assert_eq!(normalize("  Tropa   y Marinería "), "tropa y marineria");
        assert_eq!(normalize("Ley 39/2015"), "ley 39 2015");
        assert_eq!(normalize("ÑANDÚ"), "nandu");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_classify_army_topic() {
        let classifier = TopicClassifier::default();
        assert_eq!(
            classifier.classify("Tema 5 - Organización Básica del ET"),
            "Ejército de Tierra"
        );
    }

    #[test]
    fn test_classify_constitution_case_insensitive() {
        let classifier = TopicClassifier::default();
        assert_eq!(classifier.classify("TEST CONSTITUCIÓN 1978"), "Constitución Española");
        assert_eq!(classifier.classify("constitucion española - repaso"), "Constitución Española");
    }

    #[test]
    fn test_unmatched_falls_back_to_general() {
        let classifier = TopicClassifier::default();
        assert_eq!(classifier.classify("Cuestionario de bienvenida"), GENERAL_TOPIC);
        assert_eq!(classifier.classify(""), GENERAL_TOPIC);
        assert_eq!(classifier.classify("---"), GENERAL_TOPIC);
    }

    #[test]
    fn test_first_rule_wins_on_overlap() {
        let classifier = TopicClassifier::default();
        // Matches both "Seguridad Nacional" and "Estrategia de Seguridad Nacional";
        // the earlier rule takes it.
        assert_eq!(
            classifier.classify("Estrategia de Seguridad Nacional 2021"),
            "Seguridad Nacional"
        );
    }

    #[test]
    fn test_classify_is_deterministic() {
        let classifier = TopicClassifier::default();
        let title = "Simulacro OTAN y OSCE";
        let first = classifier.classify(title);
        for _ in 0..10 {
            assert_eq!(classifier.classify(title), first);
        }
        assert_eq!(first, "OTAN");
    }

    #[test]
    fn test_short_acronyms_match_whole_words_only() {
        let classifier = TopicClassifier::default();
        assert_eq!(classifier.classify("Test bonus"), GENERAL_TOPIC);
        assert_eq!(classifier.classify("Botanica basica"), GENERAL_TOPIC);
        assert_eq!(classifier.classify("Mosce y otros"), GENERAL_TOPIC);

        assert_eq!(classifier.classify("Simulacro ONU"), "Organización de las Naciones Unidas");
        assert_eq!(classifier.classify("OTAN."), "OTAN");
        assert_eq!(classifier.classify("Test (OSCE) 2"), "OSCE");
    }

    #[test]
    fn test_long_keywords_still_match_inside_words() {
        let classifier = TopicClassifier::new(
            vec![TopicRule {
                topic: "Doctrina".to_string(),
                keywords: vec!["doctrina".to_string()],
            }],
            GENERAL_TOPIC,
        );
        assert_eq!(classifier.classify("Doctrinas conjuntas"), "Doctrina");
    }

    #[test]
    fn test_custom_rules_and_fallback() {
        let classifier = TopicClassifier::new(
            vec![
                TopicRule {
                    topic: "Derecho Penal".to_string(),
                    keywords: vec!["código penal".to_string(), "delitos".to_string()],
                },
                TopicRule {
                    topic: "Vacía".to_string(),
                    keywords: vec!["  ".to_string()],
                },
            ],
            "sin clasificar",
        );

        assert_eq!(classifier.classify("Delitos contra la Administración"), "Derecho Penal");
        assert_eq!(classifier.classify("CODIGO PENAL art. 1"), "Derecho Penal");
        assert_eq!(classifier.classify("Cualquier otra cosa"), "sin clasificar");
        assert_eq!(classifier.topics(), vec!["Derecho Penal"]);
    }

    #[test]
    fn test_default_topics_in_order() {
        let classifier = TopicClassifier::default();
        let topics = classifier.topics();
        assert_eq!(topics.first(), Some(&"Constitución Española"));
        assert_eq!(topics.len(), DEFAULT_RULES.len());
    }
}
