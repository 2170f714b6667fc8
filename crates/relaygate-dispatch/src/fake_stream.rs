use bytes::Bytes;
use relaygate_common::ProviderKind;
use serde_json::{Value, json};

/// Upper bound on how much of a completion's text lands in one
/// synthesized SSE chunk. Small enough that clients built against a real
/// stream don't notice the difference.
const MAX_CHUNK_CHARS: usize = 50;

/// Splits a full, non-streaming upstream JSON response into a sequence
/// of SSE frames that imitate what the same request would have produced
/// with `stream: true`. Used when a group has `fake_streaming` enabled
/// and the client asked for a stream — the upstream call itself stays
/// non-streaming.
pub fn synthesize_sse(kind: ProviderKind, body: &[u8]) -> Vec<Bytes> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    match kind {
        ProviderKind::OpenAI => synthesize_openai(&value),
        ProviderKind::Anthropic => synthesize_anthropic(&value),
        ProviderKind::Gemini => synthesize_gemini(&value),
    }
}

fn sse_frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}

fn chunk_text(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return vec![];
    }
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let split_at = rest
            .char_indices()
            .nth(MAX_CHUNK_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(split_at);
        out.push(head);
        rest = tail;
    }
    out
}

fn synthesize_openai(value: &Value) -> Vec<Bytes> {
    let id = value.get("id").cloned().unwrap_or(json!("chatcmpl-fake"));
    let model = value.get("model").cloned().unwrap_or(json!("unknown"));
    let created = value.get("created").cloned().unwrap_or(json!(0));
    let choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let mut frames = Vec::new();
    let content = choice
        .and_then(|c| c.pointer("/message/content"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let tool_calls = choice
        .and_then(|c| c.pointer("/message/tool_calls"))
        .and_then(|v| v.as_array())
        .cloned();
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .cloned()
        .unwrap_or(json!("stop"));

    let base = |delta: Value, finish: Value| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
        })
    };

    frames.push(sse_frame(&base(json!({"role": "assistant"}), Value::Null)));

    for piece in chunk_text(content) {
        frames.push(sse_frame(&base(json!({"content": piece}), Value::Null)));
    }

    if let Some(tool_calls) = tool_calls {
        for tool_call in tool_calls {
            // The source generator always stamps tool-call deltas with
            // `index: 0` regardless of the call's true position; fake
            // streaming keeps that behavior so clients comparing real
            // and synthesized traces see byte-identical framing.
            let delta_call = json!({
                "index": 0,
                "id": tool_call.get("id").cloned().unwrap_or(Value::Null),
                "type": tool_call.get("type").cloned().unwrap_or(json!("function")),
                "function": tool_call.get("function").cloned().unwrap_or(Value::Null),
            });
            frames.push(sse_frame(&base(json!({"tool_calls": [delta_call]}), Value::Null)));
        }
    }

    frames.push(sse_frame(&base(json!({}), finish_reason)));
    frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
    frames
}

fn synthesize_anthropic(value: &Value) -> Vec<Bytes> {
    let message_id = value.get("id").cloned().unwrap_or(json!("msg-fake"));
    let model = value.get("model").cloned().unwrap_or(json!("unknown"));
    let stop_reason = value.get("stop_reason").cloned().unwrap_or(Value::Null);

    let text = value
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| blocks.iter().find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text")))
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or("");

    let mut frames = Vec::new();
    frames.push(event_frame(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
            }
        }),
    ));
    frames.push(event_frame(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ));
    for piece in chunk_text(text) {
        frames.push(event_frame(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": piece}}),
        ));
    }
    frames.push(event_frame(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": 0}),
    ));
    frames.push(event_frame(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": stop_reason}}),
    ));
    frames.push(event_frame("message_stop", json!({"type": "message_stop"})));
    frames
}

fn event_frame(event: &str, data: Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

fn synthesize_gemini(value: &Value) -> Vec<Bytes> {
    let candidate = value
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let text = candidate
        .and_then(|c| c.pointer("/content/parts/0/text"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    let finish_reason = candidate.and_then(|c| c.get("finishReason")).cloned();

    let mut frames = Vec::new();
    let pieces = chunk_text(text);
    let last_idx = pieces.len().saturating_sub(1);
    for (i, piece) in pieces.iter().enumerate() {
        let mut candidate_obj = json!({
            "content": {"role": "model", "parts": [{"text": piece}]},
            "index": 0,
        });
        if i == last_idx {
            if let Some(reason) = &finish_reason {
                candidate_obj["finishReason"] = reason.clone();
            }
        }
        frames.push(sse_frame(&json!({"candidates": [candidate_obj]})));
    }
    if pieces.is_empty() {
        let mut candidate_obj = json!({"content": {"role": "model", "parts": []}, "index": 0});
        if let Some(reason) = &finish_reason {
            candidate_obj["finishReason"] = reason.clone();
        }
        frames.push(sse_frame(&json!({"candidates": [candidate_obj]})));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_synthesis_ends_with_done_terminator() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "created": 1,
            "choices": [{"message": {"role": "assistant", "content": "hi there"}, "finish_reason": "stop"}],
        });
        let frames = synthesize_sse(ProviderKind::OpenAI, body.to_string().as_bytes());
        assert_eq!(frames.last().unwrap(), &Bytes::from_static(b"data: [DONE]\n\n"));
    }

    #[test]
    fn openai_tool_call_index_is_always_zero() {
        let body = json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "created": 1,
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "a", "arguments": "{}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "b", "arguments": "{}"}},
                    ],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let frames = synthesize_sse(ProviderKind::OpenAI, body.to_string().as_bytes());
        let tool_frames: Vec<String> = frames
            .iter()
            .map(|f| std::str::from_utf8(f).unwrap().to_string())
            .filter(|text| text.contains("\"tool_calls\":["))
            .collect();
        assert!(tool_frames.len() >= 2);
        for text in tool_frames {
            assert!(text.contains("\"index\":0"));
        }
    }

    #[test]
    fn long_content_is_split_into_bounded_chunks() {
        let long = "a".repeat(120);
        let pieces = chunk_text(&long);
        assert!(pieces.len() >= 3);
        for piece in &pieces {
            assert!(piece.len() <= MAX_CHUNK_CHARS);
        }
        assert_eq!(pieces.concat(), long);
    }

    #[test]
    fn anthropic_synthesis_emits_message_stop_last() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3",
            "stop_reason": "end_turn",
            "content": [{"type": "text", "text": "hello"}],
        });
        let frames = synthesize_sse(ProviderKind::Anthropic, body.to_string().as_bytes());
        let last = std::str::from_utf8(frames.last().unwrap()).unwrap();
        assert!(last.contains("message_stop"));
    }

    #[test]
    fn gemini_synthesis_carries_finish_reason_on_last_chunk() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "STOP",
            }]
        });
        let frames = synthesize_sse(ProviderKind::Gemini, body.to_string().as_bytes());
        let last = std::str::from_utf8(frames.last().unwrap()).unwrap();
        assert!(last.contains("STOP"));
    }
}
