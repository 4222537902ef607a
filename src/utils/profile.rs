//! Nested timing regions.
//!
//! Solvers share one [`TimeProfile`] through an `Arc`. A multigrid smoother running inside a
//! V-cycle inside an outer Krylov solve opens its region while the outer ones are still open,
//! so regions are kept on a stack and each `pop` closes the innermost one. Timings are for
//! reporting only.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Default)]
struct ProfileState {
    stack: Vec<(&'static str, Instant)>,
    totals: BTreeMap<&'static str, (Duration, usize)>,
    last: Duration,
}

#[derive(Debug)]
pub struct TimeProfile {
    name: String,
    state: Mutex<ProfileState>,
}

impl TimeProfile {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ProfileState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProfileState> {
        // timings stay usable after a panic elsewhere
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, region: &'static str) {
        self.lock().stack.push((region, Instant::now()));
    }

    /// Closes the innermost open region, returning its duration.
    pub fn pop(&self) -> Option<Duration> {
        let mut st = self.lock();
        let (region, start) = st.stack.pop()?;
        let dt = start.elapsed();
        let entry = st.totals.entry(region).or_insert((Duration::ZERO, 0));
        entry.0 += dt;
        entry.1 += 1;
        st.last = dt;
        Some(dt)
    }

    /// Opens `region` until the returned guard is dropped.
    pub fn scope(self: &Arc<Self>, region: &'static str) -> ProfileScope {
        self.push(region);
        ProfileScope {
            profile: Arc::clone(self),
            closed: false,
        }
    }

    /// Number of currently open regions.
    pub fn depth(&self) -> usize {
        self.lock().stack.len()
    }

    /// Accumulated time and entry count of `region`.
    pub fn total(&self, region: &str) -> (Duration, usize) {
        self.lock()
            .totals
            .iter()
            .find(|(k, _)| **k == region)
            .map(|(_, v)| *v)
            .unwrap_or((Duration::ZERO, 0))
    }

    /// Duration of the most recently closed region.
    pub fn last(&self) -> Duration {
        self.lock().last
    }

    pub fn report(&self) {
        let st = self.lock();
        for (region, (t, n)) in &st.totals {
            info!(profile = %self.name, region, secs = t.as_secs_f64(), count = n, "time profile");
        }
    }
}

/// Open profile region, closed on drop.
pub struct ProfileScope {
    profile: Arc<TimeProfile>,
    closed: bool,
}

impl ProfileScope {
    /// Closes the region now, returning its duration in seconds.
    pub fn close(mut self) -> f64 {
        self.closed = true;
        self.profile.pop().map(|d| d.as_secs_f64()).unwrap_or(0.0)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.closed {
            self.profile.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_regions_close_innermost_first() {
        let p = TimeProfile::new("test");
        let outer = p.scope("outer");
        {
            let _inner = p.scope("inner");
            assert_eq!(p.depth(), 2);
        }
        assert_eq!(p.depth(), 1);
        assert_eq!(p.total("inner").1, 1);
        outer.close();
        assert_eq!(p.depth(), 0);
        assert_eq!(p.total("outer").1, 1);
        assert!(p.total("outer").0 >= p.total("inner").0);
    }
}
