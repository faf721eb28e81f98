//! Advisory bandwidth model between backends.
//!
//! Links never affect correctness; schedulers use `io_time` to estimate how
//! long a transfer would take.

use std::collections::HashMap;

use stratum_core::{Result, StratumError};

use crate::backend::Backend;

/// An undirected pair of backends with one bandwidth per direction, in bytes/s.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub a: String,
    pub b: String,
    pub a_to_b: f64,
    pub b_to_a: f64,
}

impl Link {
    pub fn new(a: impl Into<String>, b: impl Into<String>, a_to_b: f64, b_to_a: f64) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            a_to_b,
            b_to_a,
        }
    }

    /// Seconds to move `size` bytes from `src` to `dst` over this link.
    pub fn io_time(&self, src: &str, dst: &str, size: usize) -> Result<f64> {
        let bandwidth = if src == self.a && dst == self.b {
            self.a_to_b
        } else if src == self.b && dst == self.a {
            self.b_to_a
        } else {
            return Err(StratumError::DeviceMismatch(format!(
                "link {} <-> {} does not connect {src} -> {dst}",
                self.a, self.b
            )));
        };
        Ok(size as f64 / bandwidth)
    }
}

/// Links keyed by backend name.
#[derive(Debug, Clone, Default)]
pub struct LinkModel {
    links: HashMap<(String, String), Link>,
    force_io_time: Option<f64>,
}

impl LinkModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, link: Link) {
        self.links
            .insert((link.b.clone(), link.a.clone()), link.clone());
        self.links.insert((link.a.clone(), link.b.clone()), link);
    }

    pub fn link(&self, a: &str, b: &str) -> Option<&Link> {
        self.links.get(&(a.to_string(), b.to_string()))
    }

    /// Make every `io_time` return `secs`; `None` restores the bandwidth model.
    pub fn set_force_io_time(&mut self, secs: Option<f64>) {
        self.force_io_time = secs;
    }

    pub fn io_time(&self, src: &Backend, dst: &Backend, size: usize) -> Result<f64> {
        let (s, d) = (src.name(), dst.name());
        let link = self.link(&s, &d).ok_or_else(|| {
            StratumError::DeviceMismatch(format!("no link between {s} and {d}"))
        })?;
        let estimate = link.io_time(&s, &d, size)?;
        Ok(self.force_io_time.unwrap_or(estimate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_directions() {
        let link = Link::new("cuda:0", "cpu", 2.0e9, 1.0e9);
        assert_eq!(link.io_time("cuda:0", "cpu", 4_000_000_000).unwrap(), 2.0);
        assert_eq!(link.io_time("cpu", "cuda:0", 4_000_000_000).unwrap(), 4.0);
        assert!(link.io_time("cpu", "disk", 1).is_err());
    }

    #[test]
    fn test_model_lookup_is_symmetric() {
        let mut model = LinkModel::new();
        model.add_link(Link::new("cpu", "disk", 1.0e9, 5.0e8));
        assert!(model.link("disk", "cpu").is_some());
        assert!(model.link("cpu", "cuda:0").is_none());
    }
}
