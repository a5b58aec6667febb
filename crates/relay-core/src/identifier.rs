use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Index,
    Worker,
    #[serde(alias = "ability")]
    Runnable,
    Ui,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Index => "index",
            IdentifierType::Worker => "worker",
            IdentifierType::Runnable => "runnable",
            IdentifierType::Ui => "ui",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a participant (concrete) or of a class of participants (pattern).
///
/// Concrete identifiers carry exactly one `type` and never `types`. Patterns may
/// leave any field empty; an empty field imposes no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<IdentifierType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<BTreeSet<IdentifierType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Identifier {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_type(kind: IdentifierType) -> Self {
        Self {
            r#type: Some(kind),
            ..Self::default()
        }
    }

    pub fn of_types(kinds: impl IntoIterator<Item = IdentifierType>) -> Self {
        Self {
            types: Some(kinds.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn index() -> Self {
        Self::of_type(IdentifierType::Index)
    }

    pub fn worker(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::of_type(IdentifierType::Worker)
        }
    }

    pub fn runnable(name: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            worker: Some(worker.into()),
            ..Self::of_type(IdentifierType::Runnable)
        }
    }

    pub fn ui(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::of_type(IdentifierType::Ui)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn is_type(&self, kind: IdentifierType) -> bool {
        self.r#type == Some(kind)
    }

    /// Whether this identifier can designate a participant of the given kind,
    /// looking at both `type` and `types`.
    pub fn covers(&self, kind: IdentifierType) -> bool {
        match self.type_set() {
            Some(set) => set.contains(&kind),
            None => false,
        }
    }

    /// Name of the worker owning the addressed participant: the name itself
    /// for a worker identifier, the `worker` field otherwise.
    pub fn worker_name(&self) -> Option<&str> {
        if self.is_type(IdentifierType::Worker) {
            return self.name.as_deref();
        }
        self.worker.as_deref()
    }

    fn type_set(&self) -> Option<BTreeSet<IdentifierType>> {
        if let Some(types) = &self.types {
            return Some(types.clone());
        }
        self.r#type.map(|kind| BTreeSet::from([kind]))
    }

    /// Treats `self` as a pattern and tests it against `concrete`.
    pub fn matches(&self, concrete: &Identifier) -> bool {
        if let Some(pattern_types) = self.type_set() {
            let Some(concrete_types) = concrete.type_set() else {
                return false;
            };
            if pattern_types.is_disjoint(&concrete_types) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if concrete.name.as_ref() != Some(name) {
                return false;
            }
        }
        if let Some(worker) = &self.worker {
            if concrete.worker.as_ref() != Some(worker) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.r#type, &self.types) {
            (Some(kind), _) => write!(f, "{kind}")?,
            (None, Some(types)) => {
                let kinds = types.iter().map(|t| t.as_str()).collect::<Vec<_>>();
                write!(f, "{}", kinds.join("|"))?;
            }
            (None, None) => f.write_str("*")?,
        }
        if let Some(name) = &self.name {
            write!(f, ":{name}")?;
        }
        if let Some(worker) = &self.worker {
            write!(f, "@{worker}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concretes() -> Vec<Identifier> {
        vec![
            Identifier::index(),
            Identifier::worker("w1"),
            Identifier::runnable("speak", "w1"),
            Identifier::runnable("hear", "w2"),
            Identifier::ui("ui-1"),
        ]
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let pattern = Identifier::any();
        for concrete in concretes() {
            assert!(pattern.matches(&concrete), "{concrete} should match");
        }
    }

    #[test]
    fn type_pattern_matches_only_that_type() {
        let pattern = Identifier::of_type(IdentifierType::Runnable);
        let matched = concretes()
            .into_iter()
            .filter(|c| pattern.matches(c))
            .collect::<Vec<_>>();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|c| c.is_type(IdentifierType::Runnable)));
    }

    #[test]
    fn types_pattern_or_matches() {
        let pattern = Identifier::of_types([IdentifierType::Ui, IdentifierType::Index]);
        assert!(pattern.matches(&Identifier::ui("ui-1")));
        assert!(pattern.matches(&Identifier::index()));
        assert!(!pattern.matches(&Identifier::worker("w1")));
        assert!(!pattern.matches(&Identifier::runnable("speak", "w1")));
    }

    #[test]
    fn name_and_worker_must_be_equal_when_present() {
        let pattern = Identifier::runnable("speak", "w1");
        assert!(pattern.matches(&Identifier::runnable("speak", "w1")));
        assert!(!pattern.matches(&Identifier::runnable("speak", "w2")));
        assert!(!pattern.matches(&Identifier::runnable("hear", "w1")));

        let by_worker = Identifier::any().with_worker("w2");
        assert!(by_worker.matches(&Identifier::runnable("hear", "w2")));
        assert!(!by_worker.matches(&Identifier::worker("w2")));
    }

    #[test]
    fn typed_pattern_rejects_untyped_concrete() {
        let pattern = Identifier::of_type(IdentifierType::Ui);
        assert!(!pattern.matches(&Identifier::any().with_name("x")));
        assert!(Identifier::any().matches(&Identifier::any()));
    }

    #[test]
    fn type_sets_overlap_on_both_sides() {
        let pattern = Identifier::of_types([IdentifierType::Worker, IdentifierType::Runnable]);
        let addressed = Identifier::of_types([IdentifierType::Ui, IdentifierType::Worker]);
        assert!(pattern.matches(&addressed));
        let ui_only = Identifier::of_types([IdentifierType::Ui]);
        assert!(!pattern.matches(&ui_only));
    }

    #[test]
    fn worker_name_depends_on_type() {
        assert_eq!(Identifier::worker("w1").worker_name(), Some("w1"));
        assert_eq!(Identifier::runnable("speak", "w2").worker_name(), Some("w2"));
        assert_eq!(Identifier::index().worker_name(), None);
    }

    #[test]
    fn wire_shape_skips_empty_fields_and_accepts_ability_alias() {
        let json = serde_json::to_value(Identifier::runnable("speak", "w1")).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({"name": "speak", "type": "runnable", "worker": "w1"})
        );

        let legacy: Identifier =
            serde_json::from_str(r#"{"name":"speak","type":"ability","worker":"w1"}"#)
                .expect("decode");
        assert_eq!(legacy, Identifier::runnable("speak", "w1"));

        let pattern: Identifier =
            serde_json::from_str(r#"{"types":["ui","worker"]}"#).expect("decode types");
        assert!(pattern.covers(IdentifierType::Ui));
        assert!(!pattern.covers(IdentifierType::Index));
    }
}
