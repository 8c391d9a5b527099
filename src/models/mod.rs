pub mod calendar;
pub mod inbox;
pub mod period;
pub mod sync_state;
