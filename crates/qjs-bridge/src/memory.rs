//! Engine memory statistics

use rquickjs::Runtime;
use std::fmt;
use std::fs;
use std::path::Path;

/// Snapshot of the runtime's allocator and heap counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReport {
    pub malloc_size: i64,
    pub malloc_limit: i64,
    pub memory_used_size: i64,
    pub malloc_count: i64,
    pub atom_count: i64,
    pub atom_size: i64,
    pub str_count: i64,
    pub str_size: i64,
    pub obj_count: i64,
    pub obj_size: i64,
    pub prop_count: i64,
    pub shape_count: i64,
    pub js_func_count: i64,
    pub c_func_count: i64,
    pub array_count: i64,
    pub fast_array_count: i64,
    pub binary_object_count: i64,
}

impl MemoryReport {
    pub(crate) fn capture(runtime: &Runtime) -> Self {
        let usage = runtime.memory_usage();
        Self {
            malloc_size: usage.malloc_size as i64,
            malloc_limit: usage.malloc_limit as i64,
            memory_used_size: usage.memory_used_size as i64,
            malloc_count: usage.malloc_count as i64,
            atom_count: usage.atom_count as i64,
            atom_size: usage.atom_size as i64,
            str_count: usage.str_count as i64,
            str_size: usage.str_size as i64,
            obj_count: usage.obj_count as i64,
            obj_size: usage.obj_size as i64,
            prop_count: usage.prop_count as i64,
            shape_count: usage.shape_count as i64,
            js_func_count: usage.js_func_count as i64,
            c_func_count: usage.c_func_count as i64,
            array_count: usage.array_count as i64,
            fast_array_count: usage.fast_array_count as i64,
            binary_object_count: usage.binary_object_count as i64,
        }
    }

    /// Per-kind object counts only
    pub fn objects(&self) -> String {
        format!(
            "objects: {}\narrays: {} ({} fast)\njs functions: {}\nc functions: {}\nbinary objects: {}\n",
            self.obj_count,
            self.array_count,
            self.fast_array_count,
            self.js_func_count,
            self.c_func_count,
            self.binary_object_count,
        )
    }

    /// Write the report to `path`, or to the log when `path` is `None`
    pub(crate) fn dump(text: &str, path: Option<&Path>) -> std::io::Result<()> {
        match path {
            Some(path) => fs::write(path, text),
            None => {
                for line in text.lines() {
                    tracing::info!("{}", line);
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "QuickJS memory usage")?;
        writeln!(f, "{:<16}{:>12}{:>14}", "NAME", "COUNT", "SIZE")?;
        writeln!(f, "{:<16}{:>12}{:>14}", "malloc", self.malloc_count, self.malloc_size)?;
        writeln!(f, "{:<16}{:>12}{:>14}", "memory used", "", self.memory_used_size)?;
        writeln!(f, "{:<16}{:>12}{:>14}", "atoms", self.atom_count, self.atom_size)?;
        writeln!(f, "{:<16}{:>12}{:>14}", "strings", self.str_count, self.str_size)?;
        writeln!(f, "{:<16}{:>12}{:>14}", "objects", self.obj_count, self.obj_size)?;
        writeln!(f, "{:<16}{:>12}", "properties", self.prop_count)?;
        writeln!(f, "{:<16}{:>12}", "shapes", self.shape_count)?;
        writeln!(f, "{:<16}{:>12}", "js functions", self.js_func_count)?;
        writeln!(f, "{:<16}{:>12}", "c functions", self.c_func_count)?;
        writeln!(f, "{:<16}{:>12}", "arrays", self.array_count)?;
        writeln!(f, "{:<16}{:>12}", "binary objects", self.binary_object_count)?;
        if self.malloc_limit > 0 {
            writeln!(f, "limit: {} bytes", self.malloc_limit)?;
        }
        Ok(())
    }
}
