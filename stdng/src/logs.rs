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

/// Logs enter/leave of a function at trace level; the leave line is written
/// when the guard is dropped, so every exit path is covered.
pub struct TraceFn {
    name: String,
}

impl TraceFn {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        tracing::trace!("{name} Enter");
        Self { name }
    }
}

impl Drop for TraceFn {
    fn drop(&mut self) {
        tracing::trace!("{} Leave", self.name);
    }
}

#[macro_export]
macro_rules! trace_fn {
    ( $name:expr ) => {
        let _trace_fn = $crate::logs::TraceFn::new($name);
    };
}
