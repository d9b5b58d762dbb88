//! Kernel symbol table view.
//!
//! The table is supplied pre-built by the caller (loading it is someone
//! else's job) and is only ever iterated for wildcard expansion.

/// Read-only, name-only set of kernel-exported functions.
#[derive(Debug, Default)]
pub struct KernelSymbols {
    names: Vec<String>,
}

impl KernelSymbols {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KernelSymbols {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
