//! Keel Server -- task-local request context, resilient dependency calls,
//! compensating units of work, and the operation wrapper behind an axum transport.

pub mod network;
pub mod service;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
