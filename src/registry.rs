//! Bookkeeping for registered services, named groups and autostart groups.
//!
//! Every operation mutates the in-memory [`ServicesConfig`]; callers persist
//! the document afterwards with [`crate::config::save_config`].

use thiserror::Error;

use crate::config::ServicesConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already added")]
    AlreadyAdded(String),
    #[error("{0} is not registered")]
    UnknownService(String),
    #[error("group name must not be empty")]
    EmptyGroupName,
    #[error("select one or more services first")]
    EmptySelection,
    #[error("no such group: {0}")]
    UnknownGroup(String),
}

impl ServicesConfig {
    pub fn contains_service(&self, path: &str) -> bool {
        self.services.iter().any(|p| p == path)
    }

    pub fn add_service(&mut self, path: &str) -> Result<(), RegistryError> {
        if self.contains_service(path) {
            return Err(RegistryError::AlreadyAdded(path.to_string()));
        }
        self.services.push(path.to_string());
        Ok(())
    }

    /// Removes a service and every reference to it.
    ///
    /// Groups left without members are deleted, and so are their autostart
    /// entries.
    pub fn remove_service(&mut self, path: &str) -> Result<(), RegistryError> {
        if !self.contains_service(path) {
            return Err(RegistryError::UnknownService(path.to_string()));
        }
        self.services.retain(|p| p != path);
        for members in self.groups.values_mut() {
            members.retain(|p| p != path);
        }
        self.groups.retain(|_, members| !members.is_empty());
        let groups = &self.groups;
        self.autostart_groups.retain(|g| groups.contains_key(g));
        Ok(())
    }

    /// Stores `paths` under `name`, replacing any group of the same name.
    pub fn save_group(&mut self, name: &str, paths: Vec<String>) -> Result<String, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyGroupName);
        }
        if paths.is_empty() {
            return Err(RegistryError::EmptySelection);
        }
        self.groups.insert(name.to_string(), paths);
        Ok(name.to_string())
    }

    pub fn delete_group(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.groups.remove(name).is_none() {
            return Err(RegistryError::UnknownGroup(name.to_string()));
        }
        self.autostart_groups.retain(|g| g != name);
        Ok(())
    }

    pub fn set_autostart(&mut self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        if enabled {
            if !self.groups.contains_key(name) {
                return Err(RegistryError::UnknownGroup(name.to_string()));
            }
            if !self.is_autostart(name) {
                self.autostart_groups.push(name.to_string());
            }
        } else {
            self.autostart_groups.retain(|g| g != name);
        }
        Ok(())
    }

    pub fn is_autostart(&self, name: &str) -> bool {
        self.autostart_groups.iter().any(|g| g == name)
    }

    /// Group names in sorted order.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn group_members(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Groups that reference `path`.
    pub fn groups_of(&self, path: &str) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|(_, members)| members.iter().any(|p| p == path))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Registered services of all autostart groups, in order and without repeats.
    pub fn autostart_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for group in &self.autostart_groups {
            let Some(members) = self.groups.get(group) else {
                continue;
            };
            for path in members {
                if self.contains_service(path) && !targets.contains(path) {
                    targets.push(path.clone());
                }
            }
        }
        targets
    }
}
