use std::collections::HashMap;

use serde_json::Value;

use omniroute_protocol::Format;

/// Per-request inputs handed to a request builder.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub model: &'a str,
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub enum TranslateError {
    /// The chunk could not be decoded as the expected dialect.
    BadChunk { expected: &'static str },
    /// The request body is missing something the target dialect requires.
    BadRequest(String),
    /// No translator covers this direction.
    Unsupported { from: Format, to: Format },
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::BadChunk { expected } => {
                write!(f, "stream chunk does not parse as {expected}")
            }
            TranslateError::BadRequest(msg) => write!(f, "untranslatable request: {msg}"),
            TranslateError::Unsupported { from, to } => {
                write!(f, "no translator for {} -> {}", from.as_str(), to.as_str())
            }
        }
    }
}

impl std::error::Error for TranslateError {}

/// One translated frame headed downstream. `event` selects the
/// `event: name\ndata: ...` SSE form used by Claude/Responses targets.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub event: Option<String>,
    pub data: Value,
}

impl StreamFrame {
    pub fn data(value: Value) -> Self {
        Self {
            event: None,
            data: value,
        }
    }

    pub fn named(event: impl Into<String>, value: Value) -> Self {
        Self {
            event: Some(event.into()),
            data: value,
        }
    }
}

/// Stateful provider-chunk → client-chunk translation. One value per stream;
/// emitted frames are monotonic in output index.
pub trait StreamTranslator: Send {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError>;

    /// Flush at upstream EOF (close any open blocks, emit trailers).
    fn finish(&mut self) -> Vec<StreamFrame> {
        Vec::new()
    }
}

pub type RequestFn = fn(&RequestContext<'_>, &Value) -> Result<Value, TranslateError>;
pub type StreamFactory = fn(&RequestContext<'_>) -> Box<dyn StreamTranslator>;

/// A directional translator pair. Either slot may be absent when only one
/// direction is needed (e.g. openai-chat → cursor requests).
#[derive(Clone, Copy, Default)]
#[derive(Debug)]
pub struct Translator {
    pub request: Option<RequestFn>,
    pub stream: Option<StreamFactory>,
}

pub struct TranslatorRegistry {
    edges: HashMap<(Format, Format), Translator>,
}

impl TranslatorRegistry {
    pub fn empty() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    /// The standard edge set wired at startup.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(
            Format::Claude,
            Format::OpenaiChat,
            Translator {
                request: Some(crate::claude2openai::request::translate),
                stream: Some(crate::claude2openai::stream::new_translator),
            },
        );
        registry.register(
            Format::OpenaiChat,
            Format::Claude,
            Translator {
                request: Some(crate::openai2claude::request::translate),
                stream: Some(crate::openai2claude::stream::new_translator),
            },
        );
        registry.register(
            Format::OpenaiChat,
            Format::OpenaiResponses,
            Translator {
                request: Some(crate::chat2responses::request::translate),
                stream: Some(crate::chat2responses::stream::new_translator),
            },
        );
        registry.register(
            Format::OpenaiResponses,
            Format::OpenaiChat,
            Translator {
                request: Some(crate::chat2responses::request::translate_back),
                stream: Some(crate::chat2responses::stream::new_reverse_translator),
            },
        );
        registry.register(
            Format::OpenaiChat,
            Format::Gemini,
            Translator {
                request: Some(crate::chat2gemini::request::translate),
                stream: Some(crate::chat2gemini::stream::new_translator),
            },
        );
        registry.register(
            Format::OpenaiChat,
            Format::Cursor,
            Translator {
                request: Some(crate::chat2cursor::request::translate),
                stream: None,
            },
        );
        registry.register(
            Format::Ollama,
            Format::OpenaiChat,
            Translator {
                request: Some(crate::chat2ollama::request::translate),
                stream: Some(crate::chat2ollama::stream::new_translator),
            },
        );
        registry
    }

    pub fn register(&mut self, from: Format, to: Format, translator: Translator) {
        self.edges.insert((from, to), translator);
    }

    /// Identity pairs resolve to a passthrough translator without
    /// registration.
    pub fn lookup(&self, from: Format, to: Format) -> Result<Translator, TranslateError> {
        if from == to {
            return Ok(Translator {
                request: Some(passthrough_request),
                stream: Some(new_passthrough_stream),
            });
        }
        self.edges
            .get(&(from, to))
            .copied()
            .ok_or(TranslateError::Unsupported { from, to })
    }
}

fn passthrough_request(_ctx: &RequestContext<'_>, body: &Value) -> Result<Value, TranslateError> {
    Ok(body.clone())
}

struct PassthroughStream;

impl StreamTranslator for PassthroughStream {
    fn translate(&mut self, chunk: &Value) -> Result<Vec<StreamFrame>, TranslateError> {
        // Named-event dialects tag the frame type in the payload itself.
        let event = chunk
            .get("type")
            .and_then(Value::as_str)
            .map(|name| name.to_string());
        Ok(vec![StreamFrame {
            event,
            data: chunk.clone(),
        }])
    }
}

fn new_passthrough_stream(_ctx: &RequestContext<'_>) -> Box<dyn StreamTranslator> {
    Box::new(PassthroughStream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_translation_is_lossless() {
        let registry = TranslatorRegistry::standard();
        let translator = registry
            .lookup(Format::OpenaiChat, Format::OpenaiChat)
            .unwrap();
        let ctx = RequestContext {
            model: "gpt-4o",
            stream: false,
        };
        let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
        let out = (translator.request.unwrap())(&ctx, &body).unwrap();
        assert_eq!(out, body);

        let mut stream = (translator.stream.unwrap())(&ctx);
        let chunk = json!({"id": "c", "choices": []});
        let frames = stream.translate(&chunk).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, chunk);
    }

    #[test]
    fn missing_edge_is_reported() {
        let registry = TranslatorRegistry::standard();
        let err = registry.lookup(Format::Gemini, Format::Cursor).unwrap_err();
        assert!(matches!(err, TranslateError::Unsupported { .. }));
    }
}
