//! Endpoint-as-tool manifest.
//!
//! One tool per non-text capability of the gateway, in the OpenAI function
//! schema. The orchestrator filters this fixed set down to the tools whose
//! endpoint model is actually present in the active preset.

use serde_json::{json, Value};

pub const TRANSCRIBE_AUDIO: &str = "transcribe_audio";
pub const GENERATE_IMAGE: &str = "generate_image";
pub const TEXT_TO_SPEECH: &str = "text_to_speech";
pub const COMPUTE_EMBEDDINGS: &str = "compute_embeddings";
pub const RERANK_DOCUMENTS: &str = "rerank_documents";

/// The full tool manifest, before availability filtering.
pub fn endpoint_tools() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": TRANSCRIBE_AUDIO,
                "description": "Transcribe an audio file to text. Use when the user asks to \
                                transcribe, caption, or convert speech to text.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "language": {
                            "type": "string",
                            "description": "Optional ISO-639-1 language code (e.g. 'en', 'es', 'fr')."
                        }
                    },
                    "required": []
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": GENERATE_IMAGE,
                "description": "Generate an image from a text description. Use when the user \
                                asks to create, draw, or generate a picture or image.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "prompt": {
                            "type": "string",
                            "description": "A detailed description of the image to generate."
                        },
                        "width": {
                            "type": "integer",
                            "description": "Image width in pixels. Default depends on model."
                        },
                        "height": {
                            "type": "integer",
                            "description": "Image height in pixels. Default depends on model."
                        },
                        "steps": {
                            "type": "integer",
                            "description": "Number of diffusion steps. More steps = higher quality but slower."
                        }
                    },
                    "required": ["prompt"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": TEXT_TO_SPEECH,
                "description": "Convert text to spoken audio. Use when the user asks to read \
                                aloud, speak, or generate audio from text.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "input": {
                            "type": "string",
                            "description": "The text to convert to speech."
                        },
                        "voice": {
                            "type": "string",
                            "description": "Voice identifier. Optional."
                        }
                    },
                    "required": ["input"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": COMPUTE_EMBEDDINGS,
                "description": "Compute vector embeddings for text. Use when the user asks to \
                                embed text, compute similarity, or prepare text for semantic search.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "input": {
                            "type": "string",
                            "description": "The text to compute embeddings for."
                        }
                    },
                    "required": ["input"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": RERANK_DOCUMENTS,
                "description": "Rerank a list of documents by relevance to a query. Use for \
                                retrieval-augmented generation (RAG) or search result reranking.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The search query to rank documents against."
                        },
                        "documents": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "List of document texts to rerank."
                        }
                    },
                    "required": ["query", "documents"]
                }
            }
        }),
    ]
}

/// The preset key a tool's endpoint model lives under.
pub fn endpoint_key(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        TRANSCRIBE_AUDIO => Some("transcription"),
        GENERATE_IMAGE => Some("image_generation"),
        TEXT_TO_SPEECH => Some("tts"),
        COMPUTE_EMBEDDINGS => Some("embeddings"),
        RERANK_DOCUMENTS => Some("reranking"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_has_five_tools_with_schemas() {
        let tools = endpoint_tools();
        assert_eq!(tools.len(), 5);
        for tool in &tools {
            assert_eq!(tool["type"], "function");
            let name = tool["function"]["name"].as_str().unwrap();
            assert!(endpoint_key(name).is_some());
            assert!(tool["function"]["parameters"]["type"] == "object");
        }
    }

    #[test]
    fn test_required_parameters() {
        let tools = endpoint_tools();
        let image = tools
            .iter()
            .find(|t| t["function"]["name"] == GENERATE_IMAGE)
            .unwrap();
        assert_eq!(image["function"]["parameters"]["required"][0], "prompt");

        let rerank = tools
            .iter()
            .find(|t| t["function"]["name"] == RERANK_DOCUMENTS)
            .unwrap();
        let required = rerank["function"]["parameters"]["required"]
            .as_array()
            .unwrap();
        assert_eq!(required.len(), 2);
    }
}
