use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use atelier_contracts::chat::{ChatMessage, ChatTranscript, Sender};
use atelier_contracts::curation::{CurationRequest, CurationResult, DataUri};
use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::models::{ModelSelection, ModelSelector};
use atelier_contracts::sessions::{write_summary, SessionSummary};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fixed persona attached to every stylist conversation.
pub const STYLIST_PERSONA: &str = "You are the Atelier Assistant, a friendly and helpful stylist \
for a wardrobe curation app. Assist with fashion questions, offer style advice, help users make \
the most of the pieces they own, and keep general conversation light. Be concise and positive. \
If asked what you can do, mention that you can discuss fashion, suggest outfits from described \
pieces, and curate a full look for an occasion. Stay in character as the Atelier Assistant.";

const SUGGESTION_PERSONA: &str = "You are a personal stylist helping users create outfits from \
their existing wardrobe. Given clothing items and an occasion, suggest a stylish outfit and be \
as descriptive as possible.";

const CHAT_TEMPERATURE: f64 = 0.7;
const REQUEST_TIMEOUT_SECONDS: f64 = 90.0;

/// Why an otherwise successful model call produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyFailure {
    #[error("content blocked by the model's safety policy: {reason}")]
    ContentBlocked { reason: String },
    #[error("the model returned an empty response")]
    EmptyResponse,
}

#[derive(Debug, Clone)]
pub struct ChatProviderRequest {
    pub model: String,
    pub persona: String,
    pub history: Vec<ChatMessage>,
    pub user_input: String,
    /// Images attached to the final user turn (outfit suggestions); empty
    /// for plain conversation.
    pub media: Vec<DataUri>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ChatProviderReply {
    pub text: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OutfitImageRequest {
    pub model: String,
    pub prompt: String,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OutfitImageResult {
    pub image_path: PathBuf,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub warnings: Vec<String>,
}

pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn reply(&self, request: &ChatProviderRequest) -> Result<ChatProviderReply>;
}

pub trait OutfitImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &OutfitImageRequest) -> Result<OutfitImageResult>;
}

#[derive(Default)]
pub struct ChatProviderRegistry {
    providers: BTreeMap<String, Box<dyn ChatProvider>>,
}

impl ChatProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ChatProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ChatProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

#[derive(Default)]
pub struct OutfitImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn OutfitImageProvider>>,
}

impl OutfitImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: OutfitImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn OutfitImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Maps conversation history plus the new user message onto the role-tagged
/// contents list a `generateContent` call expects. Turn order is preserved
/// and the new message always lands last; an empty history yields a
/// single-element list.
pub fn assemble_chat_contents(history: &[ChatMessage], user_input: &str) -> Vec<Value> {
    let mut contents = Vec::with_capacity(history.len() + 1);
    for message in history {
        contents.push(turn_value(message));
    }
    contents.push(json!({
        "role": "user",
        "parts": [{ "text": user_input }],
    }));
    contents
}

fn turn_value(message: &ChatMessage) -> Value {
    let role = match message.sender {
        Sender::User => "user",
        Sender::Ai => "model",
    };
    json!({
        "role": role,
        "parts": [{ "text": message.text }],
    })
}

fn assemble_request_contents(request: &ChatProviderRequest) -> Vec<Value> {
    if request.media.is_empty() {
        return assemble_chat_contents(&request.history, &request.user_input);
    }
    let mut contents: Vec<Value> = request.history.iter().map(turn_value).collect();
    let mut parts: Vec<Value> = request.media.iter().map(inline_image_part).collect();
    parts.push(json!({ "text": request.user_input }));
    contents.push(json!({ "role": "user", "parts": parts }));
    contents
}

fn inline_image_part(image: &DataUri) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": BASE64.encode(&image.bytes),
        }
    })
}

fn default_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_MEDIUM_AND_ABOVE",
        })
    })
    .collect()
}

/// Pulls the reply text out of a raw `generateContent` payload, or reports
/// why there is none: a content-policy decline or a plain empty answer.
/// Non-empty text passes through unchanged.
pub fn extract_reply_text(payload: &Value) -> Result<String, ReplyFailure> {
    let text = candidate_text(payload).unwrap_or_default();
    let text = text.trim();
    if !text.is_empty() {
        return Ok(text.to_string());
    }
    match decline_reason(payload) {
        Some(reason) => Err(ReplyFailure::ContentBlocked { reason }),
        None => Err(ReplyFailure::EmptyResponse),
    }
}

fn candidate_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)?;
    Some(
        parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<&str>>()
            .join(""),
    )
}

fn decline_reason(payload: &Value) -> Option<String> {
    let finish = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if matches!(finish, "SAFETY" | "IMAGE_SAFETY" | "PROHIBITED_CONTENT") {
        return Some(format!("response stopped ({finish})"));
    }
    let blocked = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)?;
    Some(format!("prompt blocked ({blocked})"))
}

struct ImageBytes {
    bytes: Vec<u8>,
    mime_type: Option<String>,
}

fn extract_image_items(payload: &Value) -> Result<Vec<ImageBytes>> {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("outfit image base64 decode failed")?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            out.push(ImageBytes { bytes, mime_type });
        }
    }

    Ok(out)
}

pub struct GeminiChatProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiChatProvider {
    pub fn new() -> Self {
        Self {
            api_base: gemini_api_base(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        endpoint_for_model(&self.api_base, model)
    }
}

impl Default for GeminiChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatProvider for GeminiChatProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn reply(&self, request: &ChatProviderRequest) -> Result<ChatProviderReply> {
        let Some(api_key) = Self::api_key() else {
            let mut reply = ScriptedChatProvider.reply(request)?;
            reply.warnings.insert(
                0,
                "Gemini API key missing; answered from the scripted stylist.".to_string(),
            );
            return Ok(reply);
        };

        let endpoint = self.endpoint_for_model(&request.model);
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(assemble_request_contents(request)),
        );
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": request.persona }] }),
        );
        if let Some(temperature) = request.temperature {
            payload.insert(
                "generationConfig".to_string(),
                json!({ "temperature": temperature }),
            );
        }
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(default_safety_settings()),
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_SECONDS))
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;

        let text = extract_reply_text(&response_payload)?;
        Ok(ChatProviderReply {
            text,
            warnings: Vec::new(),
        })
    }
}

pub struct GeminiImageProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiImageProvider {
    pub fn new() -> Self {
        Self {
            api_base: gemini_api_base(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        endpoint_for_model(&self.api_base, model)
    }
}

impl Default for GeminiImageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OutfitImageProvider for GeminiImageProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &OutfitImageRequest) -> Result<OutfitImageResult> {
        let Some(api_key) = Self::api_key() else {
            let mut result = ScriptedImageProvider.generate(request)?;
            result.warnings.insert(
                0,
                "Gemini API key missing; rendered a scripted placeholder.".to_string(),
            );
            return Ok(result);
        };

        let endpoint = self.endpoint_for_model(&request.model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
            },
            "safetySettings": default_safety_settings(),
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_SECONDS))
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;

        let items = extract_image_items(&response_payload)?;
        let Some(item) = items.into_iter().next() else {
            let failure = match decline_reason(&response_payload) {
                Some(reason) => ReplyFailure::ContentBlocked { reason },
                None => ReplyFailure::EmptyResponse,
            };
            let err = anyhow::Error::new(failure);
            return Err(match candidate_text(&response_payload)
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
            {
                Some(text) => err.context(format!("model said: {}", truncate_text(&text, 256))),
                None => err,
            });
        };

        let mime_type = item
            .mime_type
            .clone()
            .unwrap_or_else(|| "image/png".to_string());
        let ext = extension_from_mime(&mime_type);
        let image_path = request.out_dir.join(format!(
            "outfit-{}-{}.{}",
            timestamp_millis(),
            short_id(&request.prompt, 0),
            ext
        ));
        fs::create_dir_all(&request.out_dir)?;
        fs::write(&image_path, &item.bytes)
            .with_context(|| format!("failed to write {}", image_path.display()))?;

        Ok(OutfitImageResult {
            image_path,
            mime_type,
            bytes: item.bytes,
            warnings: Vec::new(),
        })
    }
}

/// Canned stylist replies, matched by keyword. This is the offline stand-in
/// for the hosted model and the fallback when no API key is configured.
pub struct ScriptedChatProvider;

const SCRIPTED_REPLIES: &[(&[&str], &str)] = &[
    (
        &["hello", "hi ", "hey"],
        "Hello! I'm the Atelier Assistant. Ask me anything about your wardrobe, or tell me the \
occasion you're dressing for.",
    ),
    (
        &["occasion", "wear", "outfit"],
        "Tell me the occasion, add a few pieces with /add, then run /curate and I'll put a look \
together for you.",
    ),
    (
        &["color", "colour"],
        "Neutrals ground a look; one accent color keeps it interesting. Pick the accent from the \
piece you love most.",
    ),
    (
        &["thank"],
        "Any time! Enjoy the look.",
    ),
    (
        &["help", "what can you"],
        "I can discuss fashion, suggest outfits from pieces you describe, and curate a full look \
for an occasion.",
    ),
];

const SCRIPTED_FALLBACK: &str = "Let's talk style! Describe a piece you own or the occasion \
you're dressing for, and I'll take it from there.";

impl ChatProvider for ScriptedChatProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn reply(&self, request: &ChatProviderRequest) -> Result<ChatProviderReply> {
        if !request.media.is_empty() {
            let text = format!(
                "Work with the {} piece(s) you shared: let the strongest one lead, keep the rest \
tonal, and finish with a single simple accessory.",
                request.media.len()
            );
            return Ok(ChatProviderReply {
                text,
                warnings: Vec::new(),
            });
        }

        let lowered = request.user_input.to_lowercase();
        let text = SCRIPTED_REPLIES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|keyword| lowered.contains(keyword)))
            .map(|(_, reply)| (*reply).to_string())
            .unwrap_or_else(|| SCRIPTED_FALLBACK.to_string());
        Ok(ChatProviderReply {
            text,
            warnings: Vec::new(),
        })
    }
}

/// Deterministic placeholder renderer: a solid-color frame derived from the
/// prompt, so offline runs still produce an artifact.
pub struct ScriptedImageProvider;

const PLACEHOLDER_SIZE: u32 = 1024;

impl OutfitImageProvider for ScriptedImageProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &OutfitImageRequest) -> Result<OutfitImageResult> {
        let (r, g, b) = color_from_prompt(&request.prompt);
        let mut frame = RgbImage::new(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE);
        for pixel in frame.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        frame
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .context("placeholder image encode failed")?;

        let image_path = request.out_dir.join(format!(
            "outfit-{}-{}.png",
            timestamp_millis(),
            short_id(&request.prompt, 0)
        ));
        fs::create_dir_all(&request.out_dir)?;
        fs::write(&image_path, &bytes)
            .with_context(|| format!("failed to write {}", image_path.display()))?;

        Ok(OutfitImageResult {
            image_path,
            mime_type: "image/png".to_string(),
            bytes,
            warnings: Vec::new(),
        })
    }
}

pub fn default_chat_providers() -> ChatProviderRegistry {
    let mut registry = ChatProviderRegistry::new();
    registry.register(GeminiChatProvider::new());
    registry.register(ScriptedChatProvider);
    registry
}

pub fn default_image_providers() -> OutfitImageProviderRegistry {
    let mut registry = OutfitImageProviderRegistry::new();
    registry.register(GeminiImageProvider::new());
    registry.register(ScriptedImageProvider);
    registry
}

/// One stylist session: a run directory holding the transcript, the event
/// trail, and any generated outfit artifacts.
pub struct StylistEngine {
    run_dir: PathBuf,
    session_id: String,
    events: EventWriter,
    transcript: ChatTranscript,
    summary_path: PathBuf,
    started_at: String,
    model_selector: ModelSelector,
    text_model: Option<String>,
    image_model: Option<String>,
    chat_providers: ChatProviderRegistry,
    image_providers: OutfitImageProviderRegistry,
    persona: String,
    curations: u64,
}

impl StylistEngine {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        text_model: Option<String>,
        image_model: Option<String>,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)?;
        let session_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session")
            .to_string();
        let events = EventWriter::new(events_path.into(), session_id.clone());
        let transcript_path = run_dir.join("transcript.json");
        let transcript = if transcript_path.exists() {
            ChatTranscript::load(&transcript_path)
        } else {
            ChatTranscript::new(&transcript_path)
        };
        let summary_path = run_dir.join("summary.json");
        let started_at = now_utc_iso();

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
            })),
        )?;

        Ok(Self {
            run_dir,
            session_id,
            events,
            transcript,
            summary_path,
            started_at,
            model_selector: ModelSelector::new(None),
            text_model,
            image_model,
            chat_providers: default_chat_providers(),
            image_providers: default_image_providers(),
            persona: STYLIST_PERSONA.to_string(),
            curations: 0,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_text_model(&mut self, model: Option<String>) {
        self.text_model = model;
    }

    pub fn text_model(&self) -> Option<&str> {
        self.text_model.as_deref()
    }

    pub fn set_image_model(&mut self, model: Option<String>) {
        self.image_model = model;
    }

    pub fn image_model(&self) -> Option<&str> {
        self.image_model.as_deref()
    }

    pub fn set_persona(&mut self, persona: impl Into<String>) {
        self.persona = persona.into();
    }

    pub fn transcript(&self) -> &ChatTranscript {
        &self.transcript
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    /// Sends one user message through the selected chat provider and returns
    /// the assistant's reply. Both turns are appended to the transcript; the
    /// reply corresponds to exactly this message.
    pub fn chat(&mut self, user_input: &str) -> Result<String> {
        let trimmed = user_input.trim();
        if trimmed.is_empty() {
            bail!("chat message must not be empty");
        }

        let selection = self.select_model(self.text_model.clone(), "text")?;
        let history = self.transcript.history();
        self.transcript.append(Sender::User, trimmed);
        self.transcript.save()?;
        self.events.emit(
            "user_message",
            map_object(json!({
                "chars": trimmed.chars().count(),
                "model": selection.model.name,
            })),
        )?;

        let request = ChatProviderRequest {
            model: selection.model.name.clone(),
            persona: self.persona.clone(),
            history,
            user_input: trimmed.to_string(),
            media: Vec::new(),
            temperature: Some(CHAT_TEMPERATURE),
        };
        let provider = self
            .chat_providers
            .get(&selection.model.provider)
            .with_context(|| {
                format!("no chat provider registered for '{}'", selection.model.provider)
            })?;

        let reply = match provider.reply(&request) {
            Ok(reply) => reply,
            Err(err) => {
                self.events.emit(
                    "chat_failed",
                    map_object(json!({
                        "model": selection.model.name,
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                return Err(err);
            }
        };
        self.emit_warnings(&reply.warnings)?;

        self.transcript.append(Sender::Ai, &reply.text);
        self.transcript.save()?;
        self.events.emit(
            "assistant_reply",
            map_object(json!({
                "chars": reply.text.chars().count(),
                "provider": selection.model.provider,
            })),
        )?;

        Ok(reply.text)
    }

    /// Runs the two-step curation flow: a textual outfit suggestion built
    /// from the clothing images, then a rendered image of that outfit on a
    /// mannequin. The generated artifact lands in the session directory.
    pub fn curate(&mut self, request: &CurationRequest) -> Result<CurationResult> {
        if request.clothing_items.is_empty() {
            bail!("curation needs at least one clothing item");
        }

        self.events.emit(
            "curation_started",
            map_object(json!({
                "occasion": request.occasion,
                "items": request.clothing_items.len(),
                "has_person_image": request.person_image.is_some(),
            })),
        )?;

        let mut media = request
            .clothing_items
            .iter()
            .map(|raw| DataUri::parse(raw))
            .collect::<Result<Vec<DataUri>>>()
            .context("clothing item is not a valid data URI")?;
        if let Some(person) = request.person_image.as_deref() {
            media.push(DataUri::parse(person).context("person image is not a valid data URI")?);
        }

        let text_selection = self.select_model(self.text_model.clone(), "vision")?;
        let suggestion_request = ChatProviderRequest {
            model: text_selection.model.name.clone(),
            persona: SUGGESTION_PERSONA.to_string(),
            history: Vec::new(),
            user_input: build_suggestion_prompt(&request.occasion, request.person_image.is_some()),
            media,
            temperature: None,
        };
        let provider = self
            .chat_providers
            .get(&text_selection.model.provider)
            .with_context(|| {
                format!(
                    "no chat provider registered for '{}'",
                    text_selection.model.provider
                )
            })?;
        let reply = match provider.reply(&suggestion_request) {
            Ok(reply) => reply,
            Err(err) => {
                self.events.emit(
                    "curation_failed",
                    map_object(json!({
                        "stage": "suggestion",
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                return Err(err);
            }
        };
        self.emit_warnings(&reply.warnings)?;
        let suggestion = reply.text;
        self.events.emit(
            "suggestion_generated",
            map_object(json!({
                "chars": suggestion.chars().count(),
                "model": text_selection.model.name,
            })),
        )?;

        let image_selection = self.select_model(self.image_model.clone(), "image")?;
        let image_provider = self
            .image_providers
            .get(&image_selection.model.provider)
            .with_context(|| {
                format!(
                    "no image provider registered for '{}'",
                    image_selection.model.provider
                )
            })?;
        let image_request = OutfitImageRequest {
            model: image_selection.model.name.clone(),
            prompt: build_outfit_image_prompt(&suggestion),
            out_dir: self.run_dir.clone(),
        };
        let image = match image_provider.generate(&image_request) {
            Ok(image) => image,
            Err(err) => {
                self.events.emit(
                    "curation_failed",
                    map_object(json!({
                        "stage": "image",
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                return Err(err);
            }
        };
        self.emit_warnings(&image.warnings)?;
        self.events.emit(
            "outfit_image_generated",
            map_object(json!({
                "path": image.image_path.to_string_lossy().to_string(),
                "provider": image_selection.model.provider,
            })),
        )?;

        self.curations += 1;
        let image_uri = DataUri::new(image.mime_type.clone(), image.bytes.clone()).encode();
        Ok(CurationResult {
            suggestion,
            image_uri: Some(image_uri),
            image_path: Some(image.image_path.to_string_lossy().to_string()),
        })
    }

    pub fn react(&mut self, turn_id: &str, nickname: &str, emoji: &str) -> Result<()> {
        if !self.transcript.add_reaction(turn_id, nickname, emoji) {
            bail!("no transcript turn with id '{turn_id}'");
        }
        self.transcript.save()?;
        self.events.emit(
            "reaction_added",
            map_object(json!({
                "turn_id": turn_id,
                "nickname": nickname,
                "emoji": emoji,
            })),
        )?;
        Ok(())
    }

    /// Starts a fresh conversation in the same session directory.
    pub fn reset(&mut self) -> Result<()> {
        self.transcript.clear();
        self.transcript.save()?;
        self.events.emit("transcript_reset", EventPayload::new())?;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<PathBuf> {
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_turns: self.transcript.turns.len() as u64,
            total_curations: self.curations,
            text_model: self.text_model.clone(),
            image_model: self.image_model.clone(),
        };
        write_summary(&self.summary_path, &summary, None)?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "summary_path": self.summary_path.to_string_lossy().to_string(),
            })),
        )?;
        Ok(self.summary_path.clone())
    }

    fn select_model(&self, requested: Option<String>, capability: &str) -> Result<ModelSelection> {
        let selection = self
            .model_selector
            .select(requested.as_deref(), capability)
            .map_err(|message| anyhow::anyhow!(message))?;
        if let Some(reason) = selection.fallback_reason.as_deref() {
            self.events.emit(
                "model_fallback",
                map_object(json!({
                    "capability": capability,
                    "model": selection.model.name,
                    "reason": reason,
                })),
            )?;
        }
        Ok(selection)
    }

    fn emit_warnings(&self, warnings: &[String]) -> Result<()> {
        for warning in warnings {
            self.events.emit(
                "provider_warning",
                map_object(json!({ "message": warning })),
            )?;
        }
        Ok(())
    }
}

fn build_suggestion_prompt(occasion: &str, has_person_image: bool) -> String {
    let mut prompt = format!(
        "Occasion: {occasion}\n\nSuggest a stylish outfit assembled from the attached clothing \
items. Be as descriptive as possible."
    );
    if has_person_image {
        prompt.push_str(
            "\nA reference photo of the person is attached last; use it to tailor the suggestion \
where appropriate, but build the outfit from the clothing items and the occasion.",
        );
    }
    prompt
}

fn build_outfit_image_prompt(suggestion: &str) -> String {
    format!(
        "Generate a high-quality, visually appealing image of the following outfit: \
\"{suggestion}\". Present it on a simple, featureless mannequin rather than a realistic person, \
with a neutral studio-like background, and keep the entire outfit clearly visible."
    )
}

fn gemini_api_base() -> String {
    env::var("GEMINI_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
}

fn endpoint_for_model(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{api_base}/{model_path}:generateContent")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn extension_from_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use atelier_contracts::chat::{ChatMessage, Sender};
    use atelier_contracts::curation::{CurationRequest, DataUri};
    use serde_json::{json, Value};

    use super::{
        assemble_chat_contents, build_outfit_image_prompt, build_suggestion_prompt,
        extract_image_items, extract_reply_text, ChatProvider, ChatProviderReply,
        ChatProviderRequest, OutfitImageProvider, OutfitImageRequest, ReplyFailure,
        ScriptedChatProvider, ScriptedImageProvider, StylistEngine,
    };

    fn message(sender: Sender, text: &str) -> ChatMessage {
        ChatMessage {
            sender,
            text: text.to_string(),
        }
    }

    fn png_data_uri() -> String {
        DataUri::new("image/png", vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a]).encode()
    }

    #[test]
    fn assembly_preserves_order_and_appends_last() {
        let history = vec![
            message(Sender::User, "hi"),
            message(Sender::Ai, "hello!"),
            message(Sender::User, "what should I wear?"),
        ];
        let contents = assemble_chat_contents(&history, "something for a picnic");

        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[0]["parts"][0]["text"], json!("hi"));
        assert_eq!(contents[1]["role"], json!("model"));
        assert_eq!(contents[2]["parts"][0]["text"], json!("what should I wear?"));
        assert_eq!(contents[3]["role"], json!("user"));
        assert_eq!(
            contents[3]["parts"][0]["text"],
            json!("something for a picnic")
        );
    }

    #[test]
    fn assembly_of_empty_history_is_a_single_turn() {
        let contents = assemble_chat_contents(&[], "hello");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[0]["parts"][0]["text"], json!("hello"));
    }

    #[test]
    fn assembly_maps_ai_turns_to_model_role() {
        let history = vec![message(Sender::User, "hi")];
        let contents = assemble_chat_contents(&history, "hello");
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["parts"][0]["text"], json!("hi"));
        assert_eq!(contents[1]["parts"][0]["text"], json!("hello"));
    }

    #[test]
    fn unwrap_passes_reply_text_through_unchanged() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Wear the linen suit." }] },
                "finishReason": "STOP",
            }]
        });
        assert_eq!(
            extract_reply_text(&payload).unwrap(),
            "Wear the linen suit."
        );
    }

    #[test]
    fn unwrap_concatenates_multiple_text_parts() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Linen " }, { "text": "suit." }] },
            }]
        });
        assert_eq!(extract_reply_text(&payload).unwrap(), "Linen suit.");
    }

    #[test]
    fn unwrap_reports_safety_stop_as_content_blocked() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [] },
                "finishReason": "SAFETY",
            }]
        });
        match extract_reply_text(&payload) {
            Err(ReplyFailure::ContentBlocked { reason }) => {
                assert!(reason.contains("SAFETY"));
            }
            other => panic!("expected ContentBlocked, got {other:?}"),
        }
    }

    #[test]
    fn unwrap_reports_prompt_block_as_content_blocked() {
        let payload = json!({
            "promptFeedback": { "blockReason": "SAFETY" },
            "candidates": [],
        });
        assert!(matches!(
            extract_reply_text(&payload),
            Err(ReplyFailure::ContentBlocked { .. })
        ));
    }

    #[test]
    fn unwrap_reports_missing_text_as_empty_response() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [] },
                "finishReason": "STOP",
            }]
        });
        assert_eq!(
            extract_reply_text(&payload),
            Err(ReplyFailure::EmptyResponse)
        );
        assert_eq!(
            extract_reply_text(&json!({})),
            Err(ReplyFailure::EmptyResponse)
        );
    }

    #[test]
    fn image_extraction_reads_inline_data_in_both_casings() -> anyhow::Result<()> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        let payload = json!({
            "candidates": [{
                "content": { "parts": [
                    { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(b"abc") } },
                    { "inline_data": { "mime_type": "image/jpeg", "data": BASE64.encode(b"def") } },
                    { "text": "caption" },
                ] },
            }]
        });
        let items = extract_image_items(&payload)?;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].bytes, b"abc");
        assert_eq!(items[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(items[1].mime_type.as_deref(), Some("image/jpeg"));
        Ok(())
    }

    #[test]
    fn scripted_chat_matches_keywords_and_falls_back() -> anyhow::Result<()> {
        let provider = ScriptedChatProvider;
        let mut request = ChatProviderRequest {
            model: "scripted-stylist-1".to_string(),
            persona: super::STYLIST_PERSONA.to_string(),
            history: Vec::new(),
            user_input: "hello there".to_string(),
            media: Vec::new(),
            temperature: Some(0.7),
        };

        let ChatProviderReply { text, .. } = provider.reply(&request)?;
        assert!(text.contains("Atelier Assistant"));

        request.user_input = "zzz".to_string();
        let fallback = provider.reply(&request)?;
        assert_eq!(fallback.text, super::SCRIPTED_FALLBACK);

        request.media = vec![DataUri::new("image/png", vec![1, 2, 3])];
        let suggestion = provider.reply(&request)?;
        assert!(suggestion.text.contains("1 piece(s)"));
        Ok(())
    }

    #[test]
    fn scripted_image_writes_a_png_artifact() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let provider = ScriptedImageProvider;
        let result = provider.generate(&OutfitImageRequest {
            model: "scripted-image-1".to_string(),
            prompt: "a linen suit on a mannequin".to_string(),
            out_dir: tmp.path().to_path_buf(),
        })?;

        assert!(result.image_path.exists());
        assert_eq!(result.mime_type, "image/png");
        // PNG signature
        assert_eq!(&result.bytes[..4], &[0x89, b'P', b'N', b'G']);
        assert_eq!(fs::read(&result.image_path)?, result.bytes);

        // same prompt, same pixels
        let again = provider.generate(&OutfitImageRequest {
            model: "scripted-image-1".to_string(),
            prompt: "a linen suit on a mannequin".to_string(),
            out_dir: tmp.path().to_path_buf(),
        })?;
        assert_eq!(again.bytes, result.bytes);
        Ok(())
    }

    #[test]
    fn engine_chat_appends_turns_and_events() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let run_dir = tmp.path().join("session-1");
        let events_path = run_dir.join("events.jsonl");
        let mut engine = StylistEngine::new(
            &run_dir,
            &events_path,
            Some("scripted-stylist-1".to_string()),
            Some("scripted-image-1".to_string()),
        )?;

        let reply = engine.chat("hello")?;
        assert!(reply.contains("Atelier Assistant"));
        assert_eq!(engine.transcript().turns.len(), 2);
        assert_eq!(engine.transcript().turns[0].sender, Sender::User);
        assert_eq!(engine.transcript().turns[1].text, reply);

        let events = fs::read_to_string(&events_path)?;
        assert!(events.contains("\"type\":\"session_started\""));
        assert!(events.contains("\"type\":\"user_message\""));
        assert!(events.contains("\"type\":\"assistant_reply\""));
        Ok(())
    }

    #[test]
    fn engine_chat_rejects_empty_input() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let run_dir = tmp.path().join("session-1");
        let mut engine = StylistEngine::new(
            &run_dir,
            run_dir.join("events.jsonl"),
            Some("scripted-stylist-1".to_string()),
            None,
        )?;
        assert!(engine.chat("   ").is_err());
        assert!(engine.transcript().turns.is_empty());
        Ok(())
    }

    #[test]
    fn engine_curate_produces_suggestion_and_artifact() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let run_dir = tmp.path().join("session-1");
        let mut engine = StylistEngine::new(
            &run_dir,
            run_dir.join("events.jsonl"),
            Some("scripted-stylist-1".to_string()),
            Some("scripted-image-1".to_string()),
        )?;

        let result = engine.curate(&CurationRequest {
            occasion: "garden party".to_string(),
            clothing_items: vec![png_data_uri(), png_data_uri()],
            person_image: None,
        })?;

        assert!(result.suggestion.contains("2 piece(s)"));
        let image_path = result.image_path.as_deref().unwrap();
        assert!(std::path::Path::new(image_path).exists());
        assert!(result
            .image_uri
            .as_deref()
            .unwrap()
            .starts_with("data:image/png;base64,"));

        let summary_path = engine.finish()?;
        let summary: Value = serde_json::from_str(&fs::read_to_string(summary_path)?)?;
        assert_eq!(summary["total_curations"], json!(1));
        Ok(())
    }

    #[test]
    fn engine_curate_requires_clothing_items() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let run_dir = tmp.path().join("session-1");
        let mut engine = StylistEngine::new(
            &run_dir,
            run_dir.join("events.jsonl"),
            Some("scripted-stylist-1".to_string()),
            Some("scripted-image-1".to_string()),
        )?;
        let err = engine
            .curate(&CurationRequest {
                occasion: "brunch".to_string(),
                clothing_items: Vec::new(),
                person_image: None,
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("at least one clothing item"));
        Ok(())
    }

    #[test]
    fn engine_curate_rejects_bad_data_uris() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let run_dir = tmp.path().join("session-1");
        let mut engine = StylistEngine::new(
            &run_dir,
            run_dir.join("events.jsonl"),
            Some("scripted-stylist-1".to_string()),
            Some("scripted-image-1".to_string()),
        )?;
        let err = engine
            .curate(&CurationRequest {
                occasion: "brunch".to_string(),
                clothing_items: vec!["http://example.com/shirt.png".to_string()],
                person_image: None,
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("data URI"));
        Ok(())
    }

    #[test]
    fn engine_react_and_reset() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let run_dir = tmp.path().join("session-1");
        let mut engine = StylistEngine::new(
            &run_dir,
            run_dir.join("events.jsonl"),
            Some("scripted-stylist-1".to_string()),
            None,
        )?;

        engine.chat("hello")?;
        let turn_id = engine.transcript().turns[1].turn_id.clone();
        engine.react(&turn_id, "sam", "🔥")?;
        assert_eq!(engine.transcript().turns[1].reactions.len(), 1);
        assert!(engine.react("t99", "sam", "🔥").is_err());

        engine.reset()?;
        assert!(engine.transcript().turns.is_empty());
        Ok(())
    }

    #[test]
    fn suggestion_prompt_mentions_person_note_only_when_present() {
        let with = build_suggestion_prompt("brunch", true);
        let without = build_suggestion_prompt("brunch", false);
        assert!(with.contains("reference photo"));
        assert!(!without.contains("reference photo"));
        assert!(without.starts_with("Occasion: brunch"));
    }

    #[test]
    fn outfit_image_prompt_embeds_the_suggestion() {
        let prompt = build_outfit_image_prompt("linen suit with loafers");
        assert!(prompt.contains("\"linen suit with loafers\""));
        assert!(prompt.contains("mannequin"));
    }
}
