pub mod corpus;
pub mod sampler;

pub use corpus::load_chunks;
pub use sampler::{binary_search, ChunkSampler, Sample};
