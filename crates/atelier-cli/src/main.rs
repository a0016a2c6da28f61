use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use atelier_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use atelier_contracts::curation::{CurationRequest, CurationResult, DataUri};
use atelier_contracts::wardrobe::{ClothingItem, WardrobeStore};
use atelier_engine::StylistEngine;
use clap::{Parser, Subcommand};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Atelier wardrobe stylist")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Curate(CurateArgs),
    Wardrobe(WardrobeArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini-2.0-flash")]
    text_model: String,
    #[arg(long)]
    image_model: Option<String>,
}

#[derive(Debug, Parser)]
struct CurateArgs {
    #[arg(long)]
    occasion: String,
    #[arg(long = "item", required = true)]
    items: Vec<PathBuf>,
    #[arg(long)]
    person: Option<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini-2.0-flash")]
    text_model: String,
    #[arg(long)]
    image_model: Option<String>,
}

#[derive(Debug, Parser)]
struct WardrobeArgs {
    #[arg(long)]
    dir: PathBuf,
    #[command(subcommand)]
    command: WardrobeCommand,
}

#[derive(Debug, Subcommand)]
enum WardrobeCommand {
    Add { paths: Vec<PathBuf> },
    List,
    Remove { id: String },
}

/// Wardrobe photos larger than this on their long edge are downscaled and
/// re-encoded before being stored as data URIs.
const MAX_ITEM_EDGE: u32 = 1280;
const JPEG_QUALITY: u8 = 85;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Curate(args) => run_curate(args),
        Command::Wardrobe(args) => run_wardrobe(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = StylistEngine::new(
        &args.out,
        &events_path,
        Some(args.text_model.clone()),
        args.image_model.clone(),
    )?;
    let mut store = WardrobeStore::load(args.out.join("wardrobe.json"));

    let stdin = io::stdin();
    let mut line = String::new();
    let mut occasion: Option<String> = None;
    let mut last_curation: Option<(CurationResult, Vec<ClothingItem>, String)> = None;

    println!("Atelier chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "quit" => break,
            "reset" => {
                engine.reset()?;
                println!("Conversation cleared.");
            }
            "set_text_model" => {
                let current = engine.text_model().unwrap_or("gemini-2.0-flash").to_string();
                let model =
                    value_as_non_empty_string(intent.command_args.get("model")).unwrap_or(current);
                engine.set_text_model(Some(model.clone()));
                println!("Text model set to {model}");
            }
            "set_image_model" => {
                let current = engine
                    .image_model()
                    .unwrap_or("gemini-2.0-flash-exp")
                    .to_string();
                let model =
                    value_as_non_empty_string(intent.command_args.get("model")).unwrap_or(current);
                engine.set_image_model(Some(model.clone()));
                println!("Image model set to {model}");
            }
            "set_occasion" => {
                if let Some(text) = value_as_non_empty_string(intent.command_args.get("occasion")) {
                    println!("Occasion set to {text}");
                    occasion = Some(text);
                } else {
                    println!("/occasion requires a description");
                }
            }
            "add_items" => {
                let paths = intent
                    .command_args
                    .get("paths")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if paths.is_empty() {
                    println!("/add requires at least one image path");
                    continue;
                }
                for path in paths.iter().filter_map(Value::as_str) {
                    match data_uri_from_path(Path::new(path)) {
                        Ok(uri) => {
                            let name = item_name_from_path(Path::new(path));
                            let item = store.add_item(&name, "", &uri);
                            println!("Added {} ({})", item.name, item.id);
                        }
                        Err(err) => eprintln!("Skipping {path}: {err:#}"),
                    }
                }
                store.save()?;
            }
            "set_person_image" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/person requires an image path");
                    continue;
                };
                match data_uri_from_path(Path::new(&path)) {
                    Ok(uri) => {
                        store.set_person(&uri);
                        store.save()?;
                        println!("Person photo updated.");
                    }
                    Err(err) => eprintln!("Could not read {path}: {err:#}"),
                }
            }
            "remove_item" => {
                let Some(id) = value_as_non_empty_string(intent.command_args.get("id")) else {
                    println!("/remove requires an item id");
                    continue;
                };
                if store.remove_item(&id) {
                    store.save()?;
                    println!("Removed {id}");
                } else {
                    println!("No wardrobe item with id {id}");
                }
            }
            "list_wardrobe" => {
                if store.items.is_empty() {
                    println!("Wardrobe is empty. Add pieces with /add <path>.");
                } else {
                    for item in &store.items {
                        println!("{}  {}", item.id, item.name);
                    }
                }
                if store.person.is_some() {
                    println!("(person photo on file)");
                }
            }
            "list_outfits" => {
                if store.outfits.is_empty() {
                    println!("No saved outfits yet. Curate one, then /save.");
                } else {
                    for outfit in &store.outfits {
                        println!(
                            "{}  {}  [{}]",
                            outfit.saved_at,
                            outfit.occasion,
                            outfit.item_names.join(", ")
                        );
                    }
                }
            }
            "curate" => {
                let requested =
                    value_as_non_empty_string(intent.command_args.get("occasion"))
                        .or_else(|| occasion.clone());
                let Some(occasion_text) = requested else {
                    println!("Set an occasion first: /curate <occasion> or /occasion <text>");
                    continue;
                };
                if store.items.is_empty() {
                    println!("Add clothing items first with /add <path>.");
                    continue;
                }
                let request = CurationRequest {
                    occasion: occasion_text.clone(),
                    clothing_items: store
                        .items
                        .iter()
                        .map(|item| item.image.clone())
                        .collect(),
                    person_image: store.person.as_ref().map(|person| person.image.clone()),
                };
                match engine.curate(&request) {
                    Ok(result) => {
                        println!("stylist> {}", result.suggestion);
                        if let Some(path) = result.image_path.as_deref() {
                            println!("Outfit image: {path}");
                        }
                        last_curation =
                            Some((result, store.items.clone(), occasion_text));
                    }
                    Err(err) => eprintln!("Curation failed: {err:#}"),
                }
            }
            "save_outfit" => {
                let Some((result, items, occasion_text)) = last_curation.as_ref() else {
                    println!("Nothing to save; run /curate first.");
                    continue;
                };
                let outfit = store.save_outfit(
                    occasion_text,
                    items,
                    &result.suggestion,
                    result.image_path.as_deref(),
                );
                store.save()?;
                println!("Saved outfit {} for {}", outfit.id, outfit.occasion);
            }
            "say" => {
                let Some(message) = intent.message.as_deref() else {
                    continue;
                };
                match engine.chat(message) {
                    Ok(reply) => println!("stylist> {reply}"),
                    Err(err) => eprintln!("Chat failed: {err:#}"),
                }
            }
            "unknown" => {
                let command = intent
                    .command_args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                println!("Unknown command /{command}. Type /help for the list.");
            }
            other => {
                println!("Unhandled action '{other}'");
            }
        }
    }

    let summary_path = engine.finish()?;
    println!("Session summary written to {}", summary_path.display());
    Ok(())
}

fn run_curate(args: CurateArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = StylistEngine::new(
        &args.out,
        &events_path,
        Some(args.text_model.clone()),
        args.image_model.clone(),
    )?;

    let clothing_items = args
        .items
        .iter()
        .map(|path| data_uri_from_path(path))
        .collect::<Result<Vec<String>>>()?;
    let person_image = args
        .person
        .as_deref()
        .map(data_uri_from_path)
        .transpose()?;

    let result = engine.curate(&CurationRequest {
        occasion: args.occasion.clone(),
        clothing_items,
        person_image,
    })?;

    println!("{}", result.suggestion);
    if let Some(path) = result.image_path.as_deref() {
        println!("Outfit image: {path}");
    }
    engine.finish()?;
    Ok(0)
}

fn run_wardrobe(args: WardrobeArgs) -> Result<i32> {
    let store_path = args.dir.join("wardrobe.json");
    let mut store = WardrobeStore::load(&store_path);

    match args.command {
        WardrobeCommand::Add { paths } => {
            if paths.is_empty() {
                eprintln!("add requires at least one image path");
                return Ok(2);
            }
            for path in &paths {
                let uri = data_uri_from_path(path)?;
                let item = store.add_item(&item_name_from_path(path), "", &uri);
                println!("Added {} ({})", item.name, item.id);
            }
            store.save()?;
        }
        WardrobeCommand::List => {
            if store.items.is_empty() {
                println!("Wardrobe is empty.");
            }
            for item in &store.items {
                println!("{}  {}", item.id, item.name);
            }
        }
        WardrobeCommand::Remove { id } => {
            if store.remove_item(&id) {
                store.save()?;
                println!("Removed {id}");
            } else {
                eprintln!("No wardrobe item with id {id}");
                return Ok(2);
            }
        }
    }
    Ok(0)
}

fn data_uri_from_path(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(path)
        .with_context(|| format!("unsupported image type: {}", path.display()))?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode {}", path.display()))?;

    let (width, height) = decoded.dimensions();
    if width.max(height) <= MAX_ITEM_EDGE {
        return Ok(DataUri::new(mime, bytes).encode());
    }

    let resized = decoded.resize(MAX_ITEM_EDGE, MAX_ITEM_EDGE, FilterType::Triangle);
    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
    resized
        .to_rgb8()
        .write_with_encoder(encoder)
        .with_context(|| format!("failed to re-encode {}", path.display()))?;
    Ok(DataUri::new("image/jpeg", encoded).encode())
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn item_name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("item")
        .replace(['_', '-'], " ")
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
