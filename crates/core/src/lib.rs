//! Voice assistant core: the streaming turn pipeline, the tool-using agent
//! behind it, and the locality resolver used to find a caller's province.
//!
//! A session is a [`pipeline::PipelineRunner`] built from processors such as
//! [`pipeline::aggregator::TurnAggregator`] and [`relay::StreamingRelay`].
//! The relay drives the shared [`agent::Agent`], which owns every live
//! conversation's memory.

pub mod agent;
pub mod frame;
pub mod llm_client;
pub mod message;
pub mod nfz;
pub mod pipeline;
pub mod relay;
pub mod resolver;
pub mod tools;
