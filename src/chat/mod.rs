pub mod events;
pub mod pipeline;

pub use events::StreamEvent;
pub use pipeline::ChatPipeline;
