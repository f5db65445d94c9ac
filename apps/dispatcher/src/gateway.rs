//! Agent runtime clients.

use std::pin::Pin;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use iotv_core::{
    AgentChunk, AgentError, AgentGateway, AgentRequest, ChunkStream, InvocationContext,
};
use reqwest::{Client, StatusCode, header};
use tracing::{debug, info};

/// Answers every invocation with an empty stream, so replies fall back to the user's input.
#[derive(Debug, Default, Clone)]
pub struct EchoAgentGateway;

#[async_trait]
impl AgentGateway for EchoAgentGateway {
    async fn invoke(
        &self,
        _ctx: InvocationContext,
        request: AgentRequest,
    ) -> Result<ChunkStream, AgentError> {
        info!(
            user = %request.user,
            agent_id = ?request.agent_id,
            "echo agent gateway invoked"
        );
        Ok(Box::pin(stream::empty::<Result<AgentChunk, AgentError>>()))
    }
}

/// POSTs the request as JSON and reads newline-delimited [`AgentChunk`] objects back.
#[derive(Clone)]
pub struct HttpAgentGateway {
    client: Client,
    url: String,
}

impl HttpAgentGateway {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AgentGateway for HttpAgentGateway {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        request: AgentRequest,
    ) -> Result<ChunkStream, AgentError> {
        let mut req = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/x-ndjson")
            .json(&request);
        for (name, value) in &ctx.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|err| AgentError::Submit(err.into()))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AgentError::Unauthorized(format!("agent returned {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Submit(anyhow!(
                "agent returned {status} body={body}"
            )));
        }
        debug!(%status, "agent stream opened");
        Ok(ndjson_chunks(resp.bytes_stream()))
    }
}

struct LineReader<S> {
    body: Pin<Box<S>>,
    buf: Vec<u8>,
    ended: bool,
}

/// Splits a byte stream on `\n` and decodes each non-blank line as an [`AgentChunk`].
///
/// A transport error is yielded once and ends the stream.
pub fn ndjson_chunks<S, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let reader = LineReader {
        body: Box::pin(body),
        buf: Vec::new(),
        ended: false,
    };
    Box::pin(stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                if let Some(item) = decode_line(&line) {
                    return Some((item, reader));
                }
                continue;
            }
            if reader.ended {
                let rest = std::mem::take(&mut reader.buf);
                return decode_line(&rest).map(|item| (item, reader));
            }
            match reader.body.next().await {
                Some(Ok(bytes)) => reader.buf.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    reader.ended = true;
                    reader.buf.clear();
                    return Some((Err(AgentError::Stream(anyhow::Error::new(err))), reader));
                }
                None => reader.ended = true,
            }
        }
    }))
}

fn decode_line(line: &[u8]) -> Option<Result<AgentChunk, AgentError>> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<AgentChunk>(line).map_err(|err| {
        AgentError::Stream(anyhow::Error::new(err).context("decode agent chunk"))
    }))
}
