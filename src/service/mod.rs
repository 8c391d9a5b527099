pub mod calendar_publisher;
pub mod document_retriever;
pub mod ics_codec;
pub mod retry;
pub mod trigger_detector;
pub mod week_planner;
