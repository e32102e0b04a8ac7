use uuid::Uuid;

use crate::models::DriverId;

/// Source of drivers for newly assigned loads.
pub trait DriverAllocator: Send + Sync {
    fn allocate(&self) -> DriverId;
}

/// Stand-in for a real matching service: every call yields a fresh random id.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDriverAllocator;

impl DriverAllocator for RandomDriverAllocator {
    fn allocate(&self) -> DriverId {
        let raw = Uuid::new_v4().simple().to_string();
        DriverId(format!("drv-{}", &raw[..12]))
    }
}

#[cfg(test)]
mod tests {
    use super::{DriverAllocator, RandomDriverAllocator};

    #[test]
    fn random_ids_are_prefixed_and_distinct() {
        let allocator = RandomDriverAllocator;
        let a = allocator.allocate();
        let b = allocator.allocate();

        assert!(a.0.starts_with("drv-"));
        assert_eq!(a.0.len(), 16);
        assert_ne!(a, b);
    }
}
