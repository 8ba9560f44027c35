/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

pub mod backoff;
pub mod logs;

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StdngError {
    #[error("mutex <{0}> is poisoned")]
    Poisoned(String),
}

pub type MutexPtr<T> = Arc<std::sync::Mutex<T>>;

pub fn new_ptr<T>(t: T) -> MutexPtr<T> {
    Arc::new(std::sync::Mutex::new(t))
}

#[macro_export]
macro_rules! lock_ptr {
    ( $mutex_arc:expr ) => {
        $mutex_arc
            .lock()
            .map_err(|_| $crate::StdngError::Poisoned(stringify!($mutex_arc).to_string()))
    };
}
