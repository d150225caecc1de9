pub mod affect;
pub mod persona;
pub mod record;
pub mod scene;
