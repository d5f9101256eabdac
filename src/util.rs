use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

const LOOKOUT_CONFIG: &str = "LOOKOUT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/lookout/lookout.json";

pub fn get_default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

pub fn get_config_path() -> PathBuf {
    std::env::var(LOOKOUT_CONFIG).map_or_else(|_| get_default_config_path(), PathBuf::from)
}

const LOOKOUT_IMAGENAME: &str = "LOOKOUT_IMAGENAME";

pub fn get_imagename() -> Option<String> {
    std::env::var(LOOKOUT_IMAGENAME)
        .ok()
        .filter(|name| !name.trim().is_empty())
}

const LOOKOUT_ENVIRONMENT: &str = "LOOKOUT_ENVIRONMENT";

const DEFAULT_ENVIRONMENT: &str = "production";

pub fn get_environment() -> String {
    std::env::var(LOOKOUT_ENVIRONMENT).unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
