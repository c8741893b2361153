use std::{marker::PhantomData, pin::Pin};

use futures::Stream;

use crate::error::ServiceError;

/// Lazily produced records. Dropping the stream cancels the pass.
pub type RecordStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T, ServiceError>> + Send + 'a>>;

/// Produces records on demand; every call to `stream` starts a new pass.
pub trait Source<T>: Send + Sync {
    fn stream(&self) -> RecordStream<'_, T>;
}

/// Consumes a record stream to the end and reports how many records it
/// accepted.
#[async_trait::async_trait]
pub trait Sink<T>: Send {
    async fn run<S>(&mut self, input: S) -> Result<u64, ServiceError>
    where
        S: Stream<Item = Result<T, ServiceError>> + Send + Unpin;
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub sink: K,
    _marker: PhantomData<fn() -> T>,
}

impl<S, T, K> Pipeline<S, T, K>
where
    T: Send,
    S: Source<T>,
    K: Sink<T>,
{
    pub fn new(source: S, sink: K) -> Self {
        Self {
            source,
            sink,
            _marker: PhantomData,
        }
    }

    /// Drives a single pass of the source into the sink.
    pub async fn run(self) -> Result<u64, ServiceError> {
        let Pipeline { source, mut sink, .. } = self;
        let stream = source.stream();
        sink.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Numbers(Vec<u32>);

    impl Source<u32> for Numbers {
        fn stream(&self) -> RecordStream<'_, u32> {
            Box::pin(futures::stream::iter(self.0.clone()).map(Ok))
        }
    }

    #[derive(Default)]
    struct Collect(Vec<u32>);

    #[async_trait::async_trait]
    impl Sink<u32> for Collect {
        async fn run<S>(&mut self, mut input: S) -> Result<u64, ServiceError>
        where
            S: Stream<Item = Result<u32, ServiceError>> + Send + Unpin,
        {
            while let Some(item) = input.next().await {
                self.0.push(item?);
            }
            Ok(self.0.len() as u64)
        }
    }

    #[tokio::test]
    async fn pipeline_drives_source_into_sink_in_order() {
        let pipeline: Pipeline<_, u32, _> = Pipeline::new(Numbers(vec![3, 1, 2]), Collect::default());
        assert_eq!(pipeline.run().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn upstream_errors_stop_the_sink() {
        struct Failing;
        impl Source<u32> for Failing {
            fn stream(&self) -> RecordStream<'_, u32> {
                Box::pin(futures::stream::iter(vec![
                    Ok(1),
                    Err(ServiceError::IndexRequired("index missing".to_string())),
                    Ok(2),
                ]))
            }
        }

        let pipeline: Pipeline<_, u32, _> = Pipeline::new(Failing, Collect::default());
        let res = pipeline.run().await;
        assert!(matches!(res, Err(ServiceError::IndexRequired(_))));
    }
}
