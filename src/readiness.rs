/// A workload is actionable once every desired replica is ready.
/// Zero desired replicas never counts as ready.
pub fn is_ready(desired: i32, ready: i32) -> bool {
    desired == ready && desired > 0
}
