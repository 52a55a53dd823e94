//! Live sequences: sinks controllers push into, the accumulator used by expansions,
//! and the transform that writes the streamed JSON envelope with consumer backpressure.

use crate::error::ODataError;
use crate::processor::annotate::Annotator;
use crate::processor::RequestScope;
use crate::service::ControllerEntry;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Binary payload with its content type.
pub struct MediaStream {
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, ODataError>>,
}

impl MediaStream {
    pub fn new<S>(content_type: Option<String>, body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, ODataError>> + Send + 'static,
    {
        MediaStream {
            content_type,
            body: body.boxed(),
        }
    }

    pub fn from_bytes(content_type: Option<String>, bytes: impl Into<Bytes>) -> Self {
        let chunk: Result<Bytes, ODataError> = Ok(bytes.into());
        MediaStream::new(content_type, stream::iter(vec![chunk]))
    }
}

/// One item pushed into a sink.
#[derive(Clone, Debug)]
pub enum Chunk {
    Entity(Value),
    /// Already serialized output, passed through unchanged.
    Raw(Bytes),
}

#[derive(Clone, Debug)]
enum SequenceState {
    Open,
    Ended,
    Failed(ODataError),
}

/// Completion signal of a live sequence; resolves on end or error.
#[derive(Clone)]
pub struct SequenceHandle {
    rx: watch::Receiver<SequenceState>,
}

impl SequenceHandle {
    pub async fn finished(mut self) -> Result<(), ODataError> {
        let state = self
            .rx
            .wait_for(|s| !matches!(s, SequenceState::Open))
            .await
            .map_err(|_| ODataError::operation(500, "live sequence dropped before it ended"))?;
        match &*state {
            SequenceState::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }
}

/// Buffers entities of a live sequence so an expansion can embed them as one collection.
#[derive(Clone, Default)]
pub struct StreamAccumulator {
    buffer: Arc<Mutex<Vec<Value>>>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> EntitySink {
        EntitySink::new(SinkTarget::Accumulator(self.clone()))
    }

    pub fn values(&self) -> Vec<Value> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    fn push(&self, v: Value) {
        if let Ok(mut b) = self.buffer.lock() {
            b.push(v);
        }
    }
}

#[derive(Clone)]
enum SinkTarget {
    Transform(Arc<StreamingTransform>),
    Accumulator(StreamAccumulator),
}

struct SinkInner {
    target: SinkTarget,
    state: watch::Sender<SequenceState>,
}

/// Writer side of a live sequence, handed to operations that declare the stream role.
#[derive(Clone)]
pub struct EntitySink {
    inner: Arc<SinkInner>,
}

impl EntitySink {
    fn new(target: SinkTarget) -> Self {
        let (state, _) = watch::channel(SequenceState::Open);
        EntitySink {
            inner: Arc::new(SinkInner { target, state }),
        }
    }

    pub(crate) fn for_transform(transform: &Arc<StreamingTransform>) -> Self {
        EntitySink::new(SinkTarget::Transform(transform.clone()))
    }

    /// Handle the operation returns so the pipeline can wait for the end of the sequence.
    pub fn handle(&self) -> SequenceHandle {
        SequenceHandle {
            rx: self.inner.state.subscribe(),
        }
    }

    pub async fn write(&self, value: Value) -> Result<(), ODataError> {
        self.write_chunk(Chunk::Entity(value)).await
    }

    pub async fn write_raw(&self, bytes: impl Into<Bytes>) -> Result<(), ODataError> {
        self.write_chunk(Chunk::Raw(bytes.into())).await
    }

    async fn write_chunk(&self, chunk: Chunk) -> Result<(), ODataError> {
        match &self.inner.target {
            SinkTarget::Transform(t) => t.write(chunk).await,
            SinkTarget::Accumulator(acc) => {
                match chunk {
                    Chunk::Entity(v) => acc.push(v),
                    Chunk::Raw(_) => tracing::debug!("raw chunk ignored by accumulator"),
                }
                Ok(())
            }
        }
    }

    /// Signal end of sequence; a streaming transform writes its closing token.
    pub async fn end(&self) -> Result<(), ODataError> {
        let flushed = match &self.inner.target {
            SinkTarget::Transform(t) => t.end().await,
            SinkTarget::Accumulator(_) => Ok(()),
        };
        self.inner.state.send_replace(match &flushed {
            Ok(()) => SequenceState::Ended,
            Err(e) => SequenceState::Failed(e.clone()),
        });
        flushed
    }

    pub fn fail(&self, error: ODataError) {
        self.inner.state.send_replace(SequenceState::Failed(error));
    }
}

/// Controller and type used to annotate streamed entities.
#[derive(Clone, Default)]
pub struct StreamTarget {
    pub controller: Option<Arc<ControllerEntry>>,
    pub element_type: Option<String>,
}

#[derive(Default)]
struct TransformState {
    enabled: bool,
    started: bool,
    ended: bool,
    closed: bool,
    result_count: usize,
    context: String,
    target: StreamTarget,
}

/// Writes streamed entities as one `{"@odata.context":...,"value":[...]}` document.
/// Output goes through a bounded channel; every push waits for the consumer to accept it.
pub struct StreamingTransform {
    scope: Arc<RequestScope>,
    state: tokio::sync::Mutex<TransformState>,
    tx: mpsc::Sender<Bytes>,
    content_type: Arc<Mutex<Option<String>>>,
}

impl StreamingTransform {
    pub(crate) fn new(scope: Arc<RequestScope>, buffer: usize) -> (Arc<Self>, ODataStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let content_type = Arc::new(Mutex::new(None));
        let transform = Arc::new(StreamingTransform {
            scope,
            state: tokio::sync::Mutex::new(TransformState::default()),
            tx,
            content_type: content_type.clone(),
        });
        (transform, ODataStream { rx, content_type })
    }

    /// Turn streaming on or off for the current step. Turning it off resets the item count.
    pub(crate) async fn configure(&self, enabled: bool, context: &str, target: StreamTarget) {
        let mut st = self.state.lock().await;
        st.enabled = enabled;
        st.context = context.to_string();
        st.target = target;
        if !enabled {
            st.result_count = 0;
        }
    }

    pub fn set_content_type(&self, content_type: &str) {
        if let Ok(mut ct) = self.content_type.lock() {
            *ct = Some(content_type.to_string());
        }
    }

    /// Whether the opening token of a streamed collection was written.
    pub async fn started(&self) -> bool {
        self.state.lock().await.started
    }

    /// Items seen while streaming was off.
    pub async fn result_count(&self) -> usize {
        self.state.lock().await.result_count
    }

    pub async fn write(&self, chunk: Chunk) -> Result<(), ODataError> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(closed());
        }
        if !st.enabled {
            st.result_count += 1;
            return Ok(());
        }
        match chunk {
            Chunk::Raw(bytes) => self.push(&mut st, bytes).await,
            Chunk::Entity(value) => {
                let Some(serialized) = self.serialize_entity(&st, value).await else {
                    return Ok(());
                };
                let mut out = Vec::with_capacity(serialized.len() + 64);
                if st.started {
                    out.push(b',');
                } else {
                    out.extend_from_slice(opening(&st.context).as_bytes());
                }
                out.extend_from_slice(&serialized);
                st.started = true;
                self.push(&mut st, Bytes::from(out)).await
            }
        }
    }

    /// Close the document: `]}` after streamed items, else a complete empty envelope.
    pub async fn end(&self) -> Result<(), ODataError> {
        let mut st = self.state.lock().await;
        if !st.enabled || st.ended {
            return Ok(());
        }
        st.ended = true;
        let closing = if st.started {
            Bytes::from_static(b"]}")
        } else {
            Bytes::from(format!("{}]}}", opening(&st.context)))
        };
        self.push(&mut st, closing).await
    }

    /// Forward a binary stream to the output.
    pub async fn pipe(&self, mut media: MediaStream) -> Result<(), ODataError> {
        while let Some(chunk) = media.body.next().await {
            self.write(Chunk::Raw(chunk?)).await?;
        }
        Ok(())
    }

    async fn serialize_entity(&self, st: &TransformState, value: Value) -> Option<Vec<u8>> {
        let annotator = Annotator::new(&self.scope, &st.context, st.target.controller.as_ref());
        let converted = annotator
            .annotate_entity(&value, st.target.element_type.as_deref(), &self.scope.path.includes)
            .await;
        let serialized = match converted {
            Ok(entity) => serde_json::to_vec(&Value::Object(entity)),
            Err(e) => {
                tracing::warn!(error = %e, "entity conversion failed, writing chunk as is");
                serde_json::to_vec(&value)
            }
        };
        match serialized {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "dropping chunk that cannot be serialized");
                None
            }
        }
    }

    async fn push(&self, st: &mut TransformState, bytes: Bytes) -> Result<(), ODataError> {
        if self.tx.send(bytes).await.is_err() {
            st.closed = true;
            return Err(closed());
        }
        Ok(())
    }
}

fn opening(context: &str) -> String {
    let quoted = serde_json::to_string(context).unwrap_or_else(|_| "\"\"".into());
    format!("{{\"@odata.context\":{},\"value\":[", quoted)
}

fn closed() -> ODataError {
    ODataError::operation(500, "response stream closed")
}

/// Consumer side of the streaming transform.
pub struct ODataStream {
    rx: mpsc::Receiver<Bytes>,
    content_type: Arc<Mutex<Option<String>>>,
}

impl ODataStream {
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Chunk already queued, without waiting.
    pub fn try_next_chunk(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn content_type(&self) -> String {
        self.content_type
            .lock()
            .ok()
            .and_then(|ct| ct.clone())
            .unwrap_or_else(|| crate::result::JSON.to_string())
    }

    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        stream::unfold(self.rx, |mut rx| async move { rx.recv().await.map(|b| (b, rx)) })
    }
}

/// Collect the remaining output as text (used by tests and small responses).
pub async fn collect_text(mut stream: ODataStream) -> String {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next_chunk().await {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::tests::{fixture_scope, CONTEXT};
    use serde_json::json;

    fn transform() -> (Arc<StreamingTransform>, ODataStream) {
        StreamingTransform::new(fixture_scope(), 4)
    }

    #[tokio::test]
    async fn empty_stream_yields_single_envelope() {
        let (t, out) = transform();
        t.configure(true, CONTEXT, StreamTarget::default()).await;
        let sink = EntitySink::for_transform(&t);
        sink.end().await.unwrap();
        drop(sink);
        drop(t);
        let text = collect_text(out).await;
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc, json!({"@odata.context": CONTEXT, "value": []}));
    }

    #[tokio::test]
    async fn three_items_concatenate_to_one_document() {
        let (t, out) = transform();
        t.configure(true, CONTEXT, StreamTarget::default()).await;
        let sink = EntitySink::for_transform(&t);
        let consumer = tokio::spawn(async move {
            let mut out = out;
            let mut chunks = Vec::new();
            while let Some(c) = out.next_chunk().await {
                chunks.push(String::from_utf8(c.to_vec()).unwrap());
            }
            chunks
        });
        for i in 1..=3 {
            sink.write(json!({"Id": i})).await.unwrap();
        }
        sink.end().await.unwrap();
        drop(sink);
        drop(t);
        let chunks = consumer.await.unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks[0].starts_with("{\"@odata.context\":"));
        assert!(chunks[1].starts_with(','));
        assert!(chunks[2].starts_with(','));
        assert_eq!(chunks[3], "]}");
        let doc: Value = serde_json::from_str(&chunks.concat()).unwrap();
        assert_eq!(
            doc,
            json!({"@odata.context": CONTEXT, "value": [{"Id": 1}, {"Id": 2}, {"Id": 3}]})
        );
    }

    #[tokio::test]
    async fn disabled_transform_only_counts() {
        let (t, mut out) = transform();
        t.configure(false, CONTEXT, StreamTarget::default()).await;
        let sink = EntitySink::for_transform(&t);
        sink.write(json!({"Id": 1})).await.unwrap();
        sink.write(json!({"Id": 2})).await.unwrap();
        sink.end().await.unwrap();
        assert_eq!(t.result_count().await, 2);
        assert!(out.try_next_chunk().is_none());
    }

    #[tokio::test]
    async fn push_waits_for_consumer() {
        let (t, mut out) = StreamingTransform::new(fixture_scope(), 1);
        t.configure(true, CONTEXT, StreamTarget::default()).await;
        t.write(Chunk::Raw(Bytes::from_static(b"a"))).await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            t.write(Chunk::Raw(Bytes::from_static(b"b"))),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(out.next_chunk().await.unwrap(), Bytes::from_static(b"a"));
        t.write(Chunk::Raw(Bytes::from_static(b"c"))).await.unwrap();
    }

    #[tokio::test]
    async fn sequence_handle_reports_end_and_failure() {
        let acc = StreamAccumulator::new();
        let sink = acc.sink();
        let handle = sink.handle();
        sink.write(json!(1)).await.unwrap();
        sink.end().await.unwrap();
        handle.finished().await.unwrap();
        assert_eq!(acc.values(), vec![json!(1)]);

        let sink = acc.sink();
        let handle = sink.handle();
        sink.fail(ODataError::BadRequest("boom".into()));
        assert_eq!(handle.finished().await, Err(ODataError::BadRequest("boom".into())));

        let sink = StreamAccumulator::new().sink();
        let handle = sink.handle();
        drop(sink);
        assert!(handle.finished().await.is_err());
    }
}
