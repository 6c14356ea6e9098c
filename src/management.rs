//! Named, externally callable management interfaces.

use crate::error::{DiagnosticsError, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DIAGNOSTIC_GROUP: &str = "Diagnostic";
pub const PAGE_LOCK_TRACKER_BEAN: &str = "PageLockTracker";

static PLATFORM_DIRECTORY: Lazy<Arc<ManagementDirectory>> =
    Lazy::new(|| Arc::new(ManagementDirectory::new()));

/// Management contract of the page-lock tracker, as seen by operators and
/// admin tooling.
pub trait PageLockTrackerBean: Send + Sync {
    /// Dumps every tracked operation.
    fn dump_locked_pages(&self) -> Result<String>;

    /// Dumps the operations owned by one thread (see [`crate::ThreadTag`]).
    fn dump_locked_pages_for_thread(&self, thread_id: u64) -> Result<String>;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Hang threshold in milliseconds.
    fn get_threshold(&self) -> u64;

    fn set_threshold(&self, millis: u64) -> Result<()>;

    fn get_dump_path(&self) -> Option<PathBuf>;

    fn set_dump_path(&self, path: Option<PathBuf>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeanName {
    pub node: String,
    pub group: String,
    pub name: String,
}

impl BeanName {
    pub fn new(node: &str, group: &str, name: &str) -> Self {
        Self {
            node: node.to_string(),
            group: group.to_string(),
            name: name.to_string(),
        }
    }

    pub fn page_lock_tracker(node: &str) -> Self {
        Self::new(node, DIAGNOSTIC_GROUP, PAGE_LOCK_TRACKER_BEAN)
    }
}

impl fmt::Display for BeanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:group={},name={}", self.node, self.group, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// The name was already taken; the existing bean was kept.
    AlreadyRegistered,
}

/// Directory of management beans keyed by name.
#[derive(Default)]
pub struct ManagementDirectory {
    beans: DashMap<BeanName, Arc<dyn PageLockTrackerBean>>,
    closed: AtomicBool,
}

impl fmt::Debug for ManagementDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementDirectory")
            .field("beans", &self.names())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ManagementDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide directory.
    pub fn platform() -> Arc<ManagementDirectory> {
        PLATFORM_DIRECTORY.clone()
    }

    pub fn register(
        &self,
        name: BeanName,
        bean: Arc<dyn PageLockTrackerBean>,
    ) -> Result<Registration> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiagnosticsError::RegistrationFailure {
                bean: name.to_string(),
                reason: "management directory is closed".to_string(),
            });
        }
        if name.node.is_empty() || name.group.is_empty() || name.name.is_empty() {
            return Err(DiagnosticsError::RegistrationFailure {
                bean: name.to_string(),
                reason: "bean name has an empty component".to_string(),
            });
        }
        let mut registration = Registration::AlreadyRegistered;
        self.beans.entry(name).or_insert_with(|| {
            registration = Registration::Registered;
            bean
        });
        Ok(registration)
    }

    pub fn unregister(&self, name: &BeanName) -> bool {
        self.beans.remove(name).is_some()
    }

    /// Removes `name` only while it still maps to `bean`, so an owner that
    /// lost the registration race cannot take down the winner's bean.
    pub fn unregister_if(&self, name: &BeanName, bean: &Arc<dyn PageLockTrackerBean>) -> bool {
        self.beans
            .remove_if(name, |_, registered| same_bean(registered, bean))
            .is_some()
    }

    pub fn lookup(&self, name: &BeanName) -> Option<Arc<dyn PageLockTrackerBean>> {
        self.beans.get(name).map(|entry| entry.value().clone())
    }

    pub fn is_registered(&self, name: &BeanName) -> bool {
        self.beans.contains_key(name)
    }

    pub fn names(&self) -> Vec<BeanName> {
        let mut names: Vec<_> = self.beans.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Refuses further registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn same_bean(a: &Arc<dyn PageLockTrackerBean>, b: &Arc<dyn PageLockTrackerBean>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct FakeBean {
        threshold: AtomicU64,
    }

    impl PageLockTrackerBean for FakeBean {
        fn dump_locked_pages(&self) -> Result<String> {
            Ok(String::new())
        }

        fn dump_locked_pages_for_thread(&self, thread_id: u64) -> Result<String> {
            Err(DiagnosticsError::NotFound(format!("thread {}", thread_id)))
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn set_enabled(&self, _enabled: bool) {}

        fn get_threshold(&self) -> u64 {
            self.threshold.load(Ordering::Relaxed)
        }

        fn set_threshold(&self, millis: u64) -> Result<()> {
            self.threshold.store(millis, Ordering::Relaxed);
            Ok(())
        }

        fn get_dump_path(&self) -> Option<PathBuf> {
            None
        }

        fn set_dump_path(&self, _path: Option<PathBuf>) {}
    }

    #[test]
    fn second_registration_is_a_no_op() {
        let directory = ManagementDirectory::new();
        let name = BeanName::page_lock_tracker("node-1");
        let first: Arc<dyn PageLockTrackerBean> = Arc::new(FakeBean::default());
        let second: Arc<dyn PageLockTrackerBean> = Arc::new(FakeBean::default());

        assert_eq!(
            directory.register(name.clone(), first.clone()).unwrap(),
            Registration::Registered
        );
        assert_eq!(
            directory.register(name.clone(), second).unwrap(),
            Registration::AlreadyRegistered
        );
        assert_eq!(directory.names().len(), 1);
        assert!(Arc::ptr_eq(&directory.lookup(&name).unwrap(), &first));
    }

    #[test]
    fn closed_directory_refuses_registration() {
        let directory = ManagementDirectory::new();
        directory.close();
        let err = directory
            .register(
                BeanName::page_lock_tracker("node-1"),
                Arc::new(FakeBean::default()),
            )
            .unwrap_err();
        assert!(matches!(err, DiagnosticsError::RegistrationFailure { .. }));
    }

    #[test]
    fn empty_node_name_is_rejected() {
        let directory = ManagementDirectory::new();
        let result = directory.register(
            BeanName::page_lock_tracker(""),
            Arc::new(FakeBean::default()),
        );
        assert!(result.is_err());
        assert!(directory.names().is_empty());
    }

    #[test]
    fn beans_are_callable_through_the_directory() {
        let directory = ManagementDirectory::new();
        let name = BeanName::page_lock_tracker("node-1");
        directory
            .register(name.clone(), Arc::new(FakeBean::default()))
            .unwrap();

        let bean = directory.lookup(&name).unwrap();
        bean.set_threshold(250).unwrap();
        assert_eq!(bean.get_threshold(), 250);
        assert!(directory.unregister(&name));
        assert!(!directory.is_registered(&name));
    }

    #[test]
    fn only_the_registered_bean_can_unregister() {
        let directory = ManagementDirectory::new();
        let name = BeanName::page_lock_tracker("node-1");
        let first: Arc<dyn PageLockTrackerBean> = Arc::new(FakeBean::default());
        let second: Arc<dyn PageLockTrackerBean> = Arc::new(FakeBean::default());
        directory.register(name.clone(), first.clone()).unwrap();
        directory.register(name.clone(), second.clone()).unwrap();

        assert!(!directory.unregister_if(&name, &second));
        assert!(directory.is_registered(&name));
        assert!(directory.unregister_if(&name, &first));
        assert!(!directory.is_registered(&name));
    }

    #[test]
    fn display_names_group_and_bean() {
        assert_eq!(
            BeanName::page_lock_tracker("node-1").to_string(),
            "node-1:group=Diagnostic,name=PageLockTracker"
        );
    }
}
