//! Job processor contract and the table binding processors to topics and channels.

use crate::error::ProcessingError;
use crate::helper::Helper;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Application callback that performs a job.
///
/// Returning `Ok` acknowledges the job. Returning an error hands the job to the
/// backend's retry policy. Async closures taking `(Arc<dyn Helper>, Vec<Value>)`
/// implement this trait.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, helper: Arc<dyn Helper>, args: Vec<Value>)
        -> Result<(), ProcessingError>;
}

#[async_trait]
impl<F, Fut> JobProcessor for F
where
    F: Fn(Arc<dyn Helper>, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn process(
        &self,
        helper: Arc<dyn Helper>,
        args: Vec<Value>,
    ) -> Result<(), ProcessingError> {
        (self)(helper, args).await
    }
}

/// Shared handle to a processor
pub type SharedProcessor = Arc<dyn JobProcessor>;

/// One (topic, channel) to processor binding
#[derive(Clone)]
pub struct ProcessorBinding {
    pub topic: String,
    pub channel: String,
    pub processor: SharedProcessor,
}

impl std::fmt::Debug for ProcessorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBinding")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Processors keyed by topic, then channel.
///
/// For the pub/sub backend the key is literally (topic, channel). For the queue
/// service the topic is the queue name and the channel is the job type.
#[derive(Clone, Default)]
pub struct ProcessorBindings {
    topics: BTreeMap<String, BTreeMap<String, SharedProcessor>>,
}

impl ProcessorBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a processor, replacing any previous binding for the same pair
    pub fn bind<P>(self, topic: impl Into<String>, channel: impl Into<String>, processor: P) -> Self
    where
        P: JobProcessor + 'static,
    {
        self.bind_shared(topic, channel, Arc::new(processor))
    }

    pub fn bind_shared(
        mut self,
        topic: impl Into<String>,
        channel: impl Into<String>,
        processor: SharedProcessor,
    ) -> Self {
        self.topics
            .entry(topic.into())
            .or_default()
            .insert(channel.into(), processor);
        self
    }

    pub fn get(&self, topic: &str, channel: &str) -> Option<&SharedProcessor> {
        self.topics.get(topic).and_then(|channels| channels.get(channel))
    }

    /// All bindings in topic, then channel order
    pub fn bindings(&self) -> Vec<ProcessorBinding> {
        self.topics
            .iter()
            .flat_map(|(topic, channels)| {
                channels.iter().map(move |(channel, processor)| ProcessorBinding {
                    topic: topic.clone(),
                    channel: channel.clone(),
                    processor: Arc::clone(processor),
                })
            })
            .collect()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ProcessorBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs: Vec<(&str, &str)> = self
            .topics
            .iter()
            .flat_map(|(topic, channels)| {
                channels
                    .keys()
                    .map(move |channel| (topic.as_str(), channel.as_str()))
            })
            .collect();
        f.debug_struct("ProcessorBindings")
            .field("bindings", &pairs)
            .finish()
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
