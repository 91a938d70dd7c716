use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use rayon::prelude::*;
use regex::Regex;
use tempfile::NamedTempFile;

use crate::mr::{
    function::{MapFn, ReduceFn},
    rpc::{KeyValue, TaskId, WorkerId},
};

/// FNV-1a 32-bit over the UTF-8 key bytes, masked to 31 bits. Matches the
/// `ihash` of the Go original (spec.md §4.2/§6) and, unlike `DefaultHasher`,
/// is stable across processes and runs — required since producer (map) and
/// consumer (reduce) agree on bucket routing only through this function.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes
        .iter()
        .fold(OFFSET_BASIS, |hash, &b| (hash ^ b as u32).wrapping_mul(PRIME))
}

/// `hash(key) mod buckets`, the partition a key's value routes to.
pub fn bucket_for_key(key: &str, buckets: u32) -> u32 {
    let masked = fnv1a_32(key.as_bytes()) & 0x7fff_ffff;
    masked % buckets
}

fn intermediate_filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^mr-(\d+)-(\d+)$").expect("static regex is valid"))
}

/// A stateless (other than its assigned id) worker: reads input, runs the
/// user map/reduce functions, and shuffles intermediate data through the
/// filesystem. One worker process is only ever touched by one task at a
/// time, so no internal synchronization is needed.
#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    working_dir: PathBuf,
    map_fn: MapFn,
    reduce_fn: ReduceFn,
}

impl Worker {
    pub fn new(id: WorkerId, working_dir: PathBuf, map_fn: MapFn, reduce_fn: ReduceFn) -> Self {
        Self {
            id,
            working_dir,
            map_fn,
            reduce_fn,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn write_atomic_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.working_dir)?;
        serde_json::to_writer(tmp.as_file_mut(), value)?;
        tmp.as_file_mut().flush()?;
        tmp.persist(path)?;
        Ok(())
    }

    /// Read `filename`, run the user map function, partition the emitted
    /// key/value pairs into `buckets` by `bucket_for_key`, and write each
    /// non-empty bucket to `mr-<task_id>-<bucket>` via write-temp-then-rename.
    pub fn do_map(&self, task_id: TaskId, filename: &str, buckets: u32) -> anyhow::Result<()> {
        let contents = fs::read_to_string(filename)?;
        println!("[Map] worker #{} read {} for task #{}", self.id, filename, task_id);

        let pairs = (self.map_fn)(filename, &contents);

        // Bucket assignment is embarrassingly parallel: each pair's
        // destination depends only on its own key.
        let assigned: Vec<(u32, KeyValue)> = pairs
            .into_par_iter()
            .map(|kv| (bucket_for_key(&kv.key, buckets), kv))
            .collect();

        let mut grouped: Vec<Vec<KeyValue>> = (0..buckets).map(|_| Vec::new()).collect();
        for (bucket, kv) in assigned {
            grouped[bucket as usize].push(kv);
        }

        for (bucket, group) in grouped.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let path = self.working_dir.join(format!("mr-{task_id}-{bucket}"));
            self.write_atomic_json(&path, &group)?;
        }

        println!("[Map] worker #{} finished task #{}", self.id, task_id);
        Ok(())
    }

    /// Enumerate all `mr-<any>-<task_id>` files in the working directory,
    /// accumulate values per key, invoke the user reduce function for each
    /// distinct key, and write `mr-out-<task_id>` via the same atomic
    /// rename. Input intermediates are deleted afterwards, best effort.
    pub fn do_reduce(&self, task_id: TaskId) -> anyhow::Result<()> {
        let files = self.intermediate_files_for(task_id)?;

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for file in &files {
            let contents = fs::read_to_string(file)?;
            let pairs: Vec<KeyValue> = serde_json::from_str(&contents)?;
            for kv in pairs {
                grouped.entry(kv.key).or_default().push(kv.value);
            }
        }

        let mut tmp = NamedTempFile::new_in(&self.working_dir)?;
        for (key, values) in &grouped {
            let value_refs: Vec<&str> = values.iter().map(String::as_str).collect();
            let result = (self.reduce_fn)(key, value_refs);
            writeln!(tmp, "{key} {result}")?;
        }
        tmp.flush()?;
        let out_path = self.working_dir.join(format!("mr-out-{task_id}"));
        tmp.persist(&out_path)?;

        for file in files {
            let _ = fs::remove_file(file);
        }

        println!("[Reduce] worker #{} finished task #{}", self.id, task_id);
        Ok(())
    }

    fn intermediate_files_for(&self, task_id: TaskId) -> anyhow::Result<Vec<PathBuf>> {
        let mut matches = Vec::new();
        for entry in fs::read_dir(&self.working_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(caps) = intermediate_filename_regex().captures(name) {
                let bucket: TaskId = caps[2].parse()?;
                if bucket == task_id {
                    matches.push(entry.path());
                }
            }
        }
        matches.sort();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::function::wc;
    use tempfile::TempDir;

    fn worker(dir: &TempDir) -> Worker {
        Worker::new(0, dir.path().to_path_buf(), wc::map, wc::reduce)
    }

    #[test]
    fn bucket_for_key_is_deterministic_and_in_range() {
        for key in ["the", "cat", "sat", "on", "the", "mat"] {
            let b1 = bucket_for_key(key, 7);
            let b2 = bucket_for_key(key, 7);
            assert_eq!(b1, b2);
            assert!(b1 < 7);
        }
    }

    #[test]
    fn bucket_for_key_routes_everything_to_zero_when_r_is_one() {
        for key in ["x", "y", "z", "anything at all"] {
            assert_eq!(bucket_for_key(key, 1), 0);
        }
    }

    #[test]
    fn word_count_single_file_single_reducer() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "the cat sat on the mat").unwrap();

        let w = worker(&dir);
        w.do_map(0, input.to_str().unwrap(), 1).unwrap();
        assert!(dir.path().join("mr-0-0").exists());

        w.do_reduce(0).unwrap();
        let out = fs::read_to_string(dir.path().join("mr-out-0")).unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["cat 1", "mat 1", "on 1", "sat 1", "the 2"]);

        // Intermediate is consumed by the reducer.
        assert!(!dir.path().join("mr-0-0").exists());
    }

    #[test]
    fn word_count_two_files_two_buckets_union_matches_reference() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "x y").unwrap();
        fs::write(&b, "y z").unwrap();

        let w = worker(&dir);
        w.do_map(0, a.to_str().unwrap(), 2).unwrap();
        w.do_map(1, b.to_str().unwrap(), 2).unwrap();

        w.do_reduce(0).unwrap();
        w.do_reduce(1).unwrap();

        let mut union = Vec::new();
        for r in 0..2 {
            let path = dir.path().join(format!("mr-out-{r}"));
            if path.exists() {
                union.extend(fs::read_to_string(path).unwrap().lines().map(str::to_string));
            }
        }
        union.sort();
        assert_eq!(union, vec!["x 1".to_string(), "y 2".to_string(), "z 1".to_string()]);
    }

    #[test]
    fn reexecuting_a_map_task_to_the_same_path_is_idempotent_for_reducers() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "a b a").unwrap();

        let w = worker(&dir);
        w.do_map(0, input.to_str().unwrap(), 1).unwrap();
        // A straggler re-executes the same map task to the same destination.
        w.do_map(0, input.to_str().unwrap(), 1).unwrap();

        w.do_reduce(0).unwrap();
        let out = fs::read_to_string(dir.path().join("mr-out-0")).unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["a 2", "b 1"]);
    }
}
