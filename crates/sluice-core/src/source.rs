use std::collections::HashSet;

use crate::error::AppError;
use crate::resource::Resource;

/// A named, immutable group of resources configured together.
///
/// Composition and selection are pure: nothing here touches the network.
#[derive(Debug, Clone)]
pub struct Source<R> {
    name: String,
    resources: Vec<R>,
}

impl<R> Source<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> &[R] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl<R: Resource> Source<R> {
    /// Group `resources` under `name`.
    ///
    /// Names must be unique and every declared dependency must be part of
    /// the group.
    pub fn new(name: impl Into<String>, resources: Vec<R>) -> Result<Self, AppError> {
        let mut names = HashSet::new();
        for resource in &resources {
            if !names.insert(resource.name()) {
                return Err(AppError::ValidationError(format!(
                    "duplicate resource '{}'",
                    resource.name()
                )));
            }
        }
        for resource in &resources {
            if let Some(dep) = &resource.meta().depends_on
                && !names.contains(dep.as_str())
            {
                return Err(AppError::ValidationError(format!(
                    "resource '{}' depends on unknown resource '{dep}'",
                    resource.name()
                )));
            }
        }

        Ok(Self {
            name: name.into(),
            resources,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name()).collect()
    }

    pub fn resource(&self, name: &str) -> Option<&R> {
        self.resources.iter().find(|r| r.name() == name)
    }
}

impl<R: Resource + Clone> Source<R> {
    /// The subset flagged as selected by default.
    pub fn selected(&self) -> Self {
        Self {
            name: self.name.clone(),
            resources: self
                .resources
                .iter()
                .filter(|r| r.meta().selected)
                .cloned()
                .collect(),
        }
    }

    /// The subset named in `names`, in declaration order.
    ///
    /// Explicit selection overrides the default selection flag. Dependencies
    /// are not pulled in: a dependent resource invokes them itself.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, AppError> {
        let wanted: HashSet<&str> = names.iter().map(|n| n.as_ref()).collect();
        for name in &wanted {
            if self.resource(name).is_none() {
                return Err(AppError::ValidationError(format!(
                    "unknown resource '{name}' in source '{}'; available: {}",
                    self.name,
                    self.names().join(", ")
                )));
            }
        }

        Ok(Self {
            name: self.name.clone(),
            resources: self
                .resources
                .iter()
                .filter(|r| wanted.contains(r.name()))
                .cloned()
                .collect(),
        })
    }
}
