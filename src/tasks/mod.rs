pub mod schedule;
pub mod sync_loop;
