// rayon-based shared memory communicator

pub struct RayonComm;

impl RayonComm {
    /// Sizes the global rayon pool to the machine; later calls keep the existing pool.
    pub fn new() -> Self {
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get())
            .build_global()
            .ok();
        RayonComm
    }
}

impl Default for RayonComm {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Comm for RayonComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        // one address space; the threads share every vector
        1
    }
    fn barrier(&self) {
        rayon::scope(|_| {});
    }
    fn all_reduce(&self, x: f64) -> f64 {
        x // reductions are already global in shared memory
    }
    fn all_reduce_slice(&self, _xs: &mut [f64]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::Comm;

    #[test]
    fn shared_memory_reduction_is_identity() {
        let comm = RayonComm::new();
        assert_eq!(comm.all_reduce(2.5), 2.5);
        let mut xs = [1.0, 2.0];
        comm.all_reduce_slice(&mut xs);
        assert_eq!(xs, [1.0, 2.0]);
        comm.barrier();
    }
}
