//! User map/reduce callables, treated as opaque pure capabilities by the
//! rest of the crate (spec.md §9 "User-function as opaque capability").
//! Hard-coded here rather than dynamically loaded; any host program may
//! instead inject its own `MapFn`/`ReduceFn` into `Worker::new`.

use crate::mr::rpc::KeyValue;

/// `(filename, contents) -> key/value pairs`.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;

/// `(key, values) -> reduce result`.
pub type ReduceFn = fn(&str, Vec<&str>) -> String;

/// Word Count application.
pub mod wc {
    use crate::mr::rpc::KeyValue;

    pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
        contents
            .split_whitespace()
            .map(|word| KeyValue::new(word, "1"))
            .collect()
    }

    pub fn reduce(_key: &str, values: Vec<&str>) -> String {
        values.len().to_string()
    }
}

// TODO: Add more functions for MapReduce applications here
