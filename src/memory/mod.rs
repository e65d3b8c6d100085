pub(crate) mod adapter;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod manager;
pub(crate) mod pool;
pub(crate) mod pool_set;
pub(crate) mod raw;
pub(crate) mod router;
pub(crate) mod shared;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
