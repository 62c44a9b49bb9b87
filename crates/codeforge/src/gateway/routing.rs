//! Routing rules: role→provider binding, prompt intent detection, and
//! adaptive model selection.
//!
//! All three are pure decision functions, total and deterministic over
//! their inputs, so routing behavior is fully unit-testable without any
//! provider in the loop.

use std::fmt;

use crate::config::ModelCatalog;
use crate::providers::ProviderKind;

/// Supervisory roles bound to the bot provider.
const SUPERVISORY_ROLES: &[&str] = &[
    "planner", "frontend", "backend", "devops", "qa", "android", "ios",
];

/// Execution roles bound to the chat provider.
const EXECUTION_ROLES: &[&str] = &["builder", "installer", "fixer", "coder", "executor"];

/// Resolve a role name to its provider.
///
/// Known roles bind directly; unknown roles fall through to substring
/// matching on the normalized name, defaulting to the chat provider.
pub fn provider_for_role(role: &str) -> ProviderKind {
    let normalized = role.to_ascii_lowercase();
    let name = normalized.as_str();

    if SUPERVISORY_ROLES.contains(&name) {
        return ProviderKind::Bot;
    }
    if EXECUTION_ROLES.contains(&name) {
        return ProviderKind::Chat;
    }

    // Substring fallback for unknown roles, first match wins.
    const SUBSTRING_TABLE: &[(&[&str], ProviderKind)] = &[
        (&["plan", "architect"], ProviderKind::Bot),
        (&["front"], ProviderKind::Bot),
        (&["back"], ProviderKind::Bot),
        (&["devops", "deploy"], ProviderKind::Bot),
        (&["qa", "test", "quality"], ProviderKind::Bot),
        (&["android", "mobile"], ProviderKind::Bot),
        (&["ios", "apple", "swift"], ProviderKind::Bot),
        (&["build", "code", "install", "fix"], ProviderKind::Chat),
    ];
    for (needles, provider) in SUBSTRING_TABLE {
        if needles.iter().any(|n| name.contains(n)) {
            return *provider;
        }
    }
    ProviderKind::Chat
}

/// Declared complexity of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl Complexity {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Self::Simple,
            "complex" => Self::Complex,
            _ => Self::Medium,
        }
    }
}

/// Closed-set prompt intent, used only by adaptive routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Scaffold,
    Crud,
    Static,
    Refactor,
    General,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scaffold => write!(f, "scaffold"),
            Self::Crud => write!(f, "crud"),
            Self::Static => write!(f, "static"),
            Self::Refactor => write!(f, "refactor"),
            Self::General => write!(f, "general"),
        }
    }
}

/// Classify a prompt into exactly one intent, first match wins.
pub fn detect_intent(prompt: &str) -> Intent {
    let p = prompt.to_ascii_lowercase();
    const RULES: &[(&[&str], Intent)] = &[
        (&["scaffold", "boilerplate", "setup", "new project"], Intent::Scaffold),
        (&["crud", "form", "api", "list"], Intent::Crud),
        (&["static", "landing", "html only"], Intent::Static),
        (&["refactor", "optimize", "migration"], Intent::Refactor),
    ];
    for (needles, intent) in RULES {
        if needles.iter().any(|n| p.contains(n)) {
            return *intent;
        }
    }
    Intent::General
}

/// A model decision with its audit reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub model: String,
    pub reason: String,
}

/// Pick a chat-provider model from role, complexity, intent, and the
/// current builder-queue depth. First matching row of the table wins.
pub fn select_model(
    models: &ModelCatalog,
    role: &str,
    complexity: Complexity,
    intent: Intent,
    queue_depth: usize,
) -> ModelChoice {
    let normalized = role.to_ascii_lowercase();

    // Fixer is pinned to the small model regardless of everything else.
    if normalized == "fixer" {
        return ModelChoice {
            model: models.fixer.clone(),
            reason: "fixer_pinned".into(),
        };
    }

    // Non-builder roles get the large model for quality.
    if !matches!(normalized.as_str(), "builder" | "coder" | "executor") {
        return ModelChoice {
            model: models.large.clone(),
            reason: "planner_quality_pinned".into(),
        };
    }

    match complexity {
        Complexity::Complex => match intent {
            Intent::Crud | Intent::Static | Intent::Scaffold => ModelChoice {
                model: models.mid.clone(),
                reason: format!("complex_optimized_{intent}"),
            },
            _ => ModelChoice {
                model: models.large.clone(),
                reason: "complex_pinned_quality".into(),
            },
        },
        Complexity::Simple => {
            if queue_depth >= 3 {
                ModelChoice {
                    model: models.small.clone(),
                    reason: "simple_queue_high".into(),
                }
            } else if queue_depth >= 2 {
                ModelChoice {
                    model: models.mid.clone(),
                    reason: "simple_queue_medium".into(),
                }
            } else {
                ModelChoice {
                    model: models.large.clone(),
                    reason: "simple_queue_low".into(),
                }
            }
        }
        Complexity::Medium => {
            if queue_depth >= 3 {
                ModelChoice {
                    model: models.mid.clone(),
                    reason: "medium_queue_high".into(),
                }
            } else if intent == Intent::Static {
                ModelChoice {
                    model: models.mid.clone(),
                    reason: "medium_optimized_static".into(),
                }
            } else {
                ModelChoice {
                    model: models.large.clone(),
                    reason: "medium_standard".into(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        ModelCatalog {
            large: "large".into(),
            mid: "mid".into(),
            small: "small".into(),
            fixer: "fixer-small".into(),
        }
    }

    #[test]
    fn test_known_roles_bind_directly() {
        for role in ["planner", "frontend", "backend", "devops", "qa", "android", "ios"] {
            assert_eq!(provider_for_role(role), ProviderKind::Bot, "{role}");
        }
        for role in ["builder", "installer", "fixer", "coder", "executor"] {
            assert_eq!(provider_for_role(role), ProviderKind::Chat, "{role}");
        }
    }

    #[test]
    fn test_role_matching_is_case_insensitive() {
        assert_eq!(provider_for_role("Planner"), ProviderKind::Bot);
        assert_eq!(provider_for_role("BUILDER"), ProviderKind::Chat);
    }

    #[test]
    fn test_unknown_roles_use_substring_fallback() {
        assert_eq!(provider_for_role("chief-architect"), ProviderKind::Bot);
        assert_eq!(provider_for_role("frontend-lead"), ProviderKind::Bot);
        assert_eq!(provider_for_role("deployer"), ProviderKind::Bot);
        assert_eq!(provider_for_role("test-runner"), ProviderKind::Bot);
        assert_eq!(provider_for_role("swift-dev"), ProviderKind::Bot);
        assert_eq!(provider_for_role("code-monkey"), ProviderKind::Chat);
        assert_eq!(provider_for_role("hotfixer"), ProviderKind::Chat);
    }

    #[test]
    fn test_fully_unknown_role_defaults_to_chat() {
        assert_eq!(provider_for_role("wizard"), ProviderKind::Chat);
    }

    #[test]
    fn test_intent_first_match_wins() {
        // "scaffold" beats the later "api" rule.
        assert_eq!(detect_intent("Scaffold an API service"), Intent::Scaffold);
        assert_eq!(detect_intent("a CRUD app with forms"), Intent::Crud);
        assert_eq!(detect_intent("static landing page"), Intent::Static);
        assert_eq!(detect_intent("refactor the parser"), Intent::Refactor);
        assert_eq!(detect_intent("write a chess engine"), Intent::General);
    }

    #[test]
    fn test_intent_is_case_insensitive() {
        assert_eq!(detect_intent("HTML ONLY please"), Intent::Static);
        assert_eq!(detect_intent("NEW PROJECT for me"), Intent::Scaffold);
    }

    #[test]
    fn test_fixer_pinned() {
        for complexity in [Complexity::Simple, Complexity::Medium, Complexity::Complex] {
            for depth in [0, 5] {
                let choice = select_model(&catalog(), "fixer", complexity, Intent::General, depth);
                assert_eq!(choice.model, "fixer-small");
                assert_eq!(choice.reason, "fixer_pinned");
            }
        }
    }

    #[test]
    fn test_non_builder_pinned_to_large() {
        let choice = select_model(&catalog(), "planner", Complexity::Simple, Intent::Crud, 4);
        assert_eq!(choice.model, "large");
        assert_eq!(choice.reason, "planner_quality_pinned");

        // Installer is an execution role but not adaptive.
        let choice = select_model(&catalog(), "installer", Complexity::Complex, Intent::Crud, 0);
        assert_eq!(choice.reason, "planner_quality_pinned");
    }

    #[test]
    fn test_complex_optimized_intents() {
        for (intent, reason) in [
            (Intent::Crud, "complex_optimized_crud"),
            (Intent::Static, "complex_optimized_static"),
            (Intent::Scaffold, "complex_optimized_scaffold"),
        ] {
            let choice = select_model(&catalog(), "builder", Complexity::Complex, intent, 0);
            assert_eq!(choice.model, "mid");
            assert_eq!(choice.reason, reason);
        }
    }

    #[test]
    fn test_complex_general_pins_quality() {
        let choice = select_model(&catalog(), "coder", Complexity::Complex, Intent::General, 9);
        assert_eq!(choice.model, "large");
        assert_eq!(choice.reason, "complex_pinned_quality");
    }

    #[test]
    fn test_simple_queue_tiers() {
        let choice = select_model(&catalog(), "builder", Complexity::Simple, Intent::General, 3);
        assert_eq!((choice.model.as_str(), choice.reason.as_str()), ("small", "simple_queue_high"));

        let choice = select_model(&catalog(), "builder", Complexity::Simple, Intent::General, 2);
        assert_eq!((choice.model.as_str(), choice.reason.as_str()), ("mid", "simple_queue_medium"));

        let choice = select_model(&catalog(), "builder", Complexity::Simple, Intent::General, 1);
        assert_eq!((choice.model.as_str(), choice.reason.as_str()), ("large", "simple_queue_low"));
    }

    #[test]
    fn test_medium_rows() {
        let choice = select_model(&catalog(), "executor", Complexity::Medium, Intent::General, 3);
        assert_eq!((choice.model.as_str(), choice.reason.as_str()), ("mid", "medium_queue_high"));

        let choice = select_model(&catalog(), "executor", Complexity::Medium, Intent::Static, 0);
        assert_eq!(
            (choice.model.as_str(), choice.reason.as_str()),
            ("mid", "medium_optimized_static")
        );

        let choice = select_model(&catalog(), "executor", Complexity::Medium, Intent::General, 0);
        assert_eq!((choice.model.as_str(), choice.reason.as_str()), ("large", "medium_standard"));
    }

    #[test]
    fn test_queue_high_beats_static_for_reason() {
        // Both conditions hold; the queue row is listed first.
        let choice = select_model(&catalog(), "builder", Complexity::Medium, Intent::Static, 4);
        assert_eq!(choice.reason, "medium_queue_high");
    }

    #[test]
    fn test_table_is_total_and_deterministic() {
        let models = catalog();
        let roles = ["builder", "coder", "executor", "fixer", "planner", "unknown-role"];
        let complexities = [Complexity::Simple, Complexity::Medium, Complexity::Complex];
        let intents = [
            Intent::Scaffold,
            Intent::Crud,
            Intent::Static,
            Intent::Refactor,
            Intent::General,
        ];
        for role in roles {
            for complexity in complexities {
                for intent in intents {
                    for depth in 0..5 {
                        let a = select_model(&models, role, complexity, intent, depth);
                        let b = select_model(&models, role, complexity, intent, depth);
                        assert_eq!(a, b);
                        assert!(!a.model.is_empty());
                        assert!(!a.reason.is_empty());
                    }
                }
            }
        }
    }
}
