use std::io;
use std::path::PathBuf;

use dc_backend::DifyClient;
use dc_core::config::Config;
use dc_core::render::{Renderer, Style};
use dc_core::Conversation;
use dc_protocol::{ChatRequest, TextToAudioRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("difychat: stream answers from a Dify chat application");
    println!();
    println!("Usage:");
    println!("  difychat \"question\"          Ask one question");
    println!("  echo \"question\" | difychat   Ask one question per stdin line");
    println!();
    println!("Options:");
    println!("  --blocking        Wait for the whole answer instead of streaming");
    println!("  --audio <path>    Write speech for the last answer to <path>");
    println!("  --version         Print version");
    println!("  --help            Print this help");
    println!();
    println!("Environment:");
    println!("  DIFY_API_BASE_URL  Overrides [api].base_url");
    println!("  DIFY_API_TOKEN     Used when no token or token_cmd is configured");
    println!("  RUST_LOG           Log filter for stderr (default: warn)");
}

struct Args {
    question: Option<String>,
    blocking: bool,
    audio: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        question: None,
        blocking: false,
        audio: None,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--blocking" => parsed.blocking = true,
            "--audio" => match iter.next() {
                Some(path) => parsed.audio = Some(PathBuf::from(path)),
                None => return Err("--audio needs a path".to_string()),
            },
            flag if flag.starts_with('-') => return Err(format!("unknown option: {flag}")),
            question => {
                if parsed.question.is_some() {
                    return Err("only one question may be given; quote it".to_string());
                }
                parsed.question = Some(question.to_string());
            }
        }
    }
    Ok(parsed)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("difychat {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("hint: difychat --help");
            std::process::exit(2);
        }
    };

    init_logging();

    let config = Config::load_or_default();
    let token = match config.api.resolve_token() {
        Ok(token) => token,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let client = match DifyClient::with_connect_timeout(
        config.api.base_url.as_str(),
        token,
        config.api.connect_timeout(),
    ) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(client, &config, args));
    std::process::exit(code);
}

async fn run(client: DifyClient, config: &Config, args: Args) -> i32 {
    let mut renderer = Renderer::new(io::stdout(), io::stderr(), Style::default());
    let mut conversation = Conversation::new(client.clone(), config.session.user.as_str())
        .with_conversation_id(config.session.conversation_id.clone());
    let mut code = 0;
    let mut last_answer: Option<String> = None;

    let mut questions = Questions::new(args.question);
    while let Some(question) = questions.next().await {
        let answer = if args.blocking {
            ask_blocking(&client, &conversation, &mut renderer, &question).await
        } else {
            ask_streaming(&mut conversation, &mut renderer, &question).await
        };
        match answer {
            Some(answer) => last_answer = Some(answer),
            None => code = 1,
        }
    }

    if let (Some(path), Some(text)) = (args.audio, last_answer) {
        let request = TextToAudioRequest::for_text(text, conversation.user());
        match client.text_to_audio(&request).await {
            Ok(audio) => {
                if let Err(e) = tokio::fs::write(&path, &audio).await {
                    renderer.emit_error(&format!("failed to write {}: {e}", path.display()));
                    code = 1;
                } else {
                    debug!("wrote {} bytes of audio to {}", audio.len(), path.display());
                }
            }
            Err(e) => {
                renderer.emit_error(&e.to_string());
                code = 1;
            }
        }
    }

    code
}

/// Stream one answer to the terminal. Returns the answer text unless the
/// stream ended in an error.
async fn ask_streaming(
    conversation: &mut Conversation<DifyClient>,
    renderer: &mut Renderer<io::Stdout, io::Stderr>,
    question: &str,
) -> Option<String> {
    let sent = conversation
        .send_message_observed(question, |message| renderer.emit_progress(message))
        .await;

    match sent {
        Ok(Some(_)) => {}
        Ok(None) => return Some(String::new()),
        Err(e) => {
            renderer.emit_error(&e.to_string());
            return None;
        }
    }

    let answer = conversation.last_message().map(|message| {
        renderer.emit_end(message);
        message.content.clone()
    });

    match conversation.error() {
        Some(reason) => {
            renderer.emit_error(reason);
            None
        }
        None => answer,
    }
}

async fn ask_blocking(
    client: &DifyClient,
    conversation: &Conversation<DifyClient>,
    renderer: &mut Renderer<io::Stdout, io::Stderr>,
    question: &str,
) -> Option<String> {
    let request = ChatRequest::new(question, conversation.user())
        .with_conversation(conversation.conversation_id().map(str::to_string));

    match client.send_blocking(&request).await {
        Ok(response) => {
            debug!("conversation {}", response.conversation_id);
            renderer.emit_answer(&response.content);
            Some(response.content)
        }
        Err(e) => {
            renderer.emit_error(&e.to_string());
            None
        }
    }
}

/// The question from the command line, or else one per non-blank stdin line.
enum Questions {
    Single(Option<String>),
    Stdin(tokio::io::Lines<BufReader<tokio::io::Stdin>>),
}

impl Questions {
    fn new(question: Option<String>) -> Self {
        match question {
            Some(q) => Self::Single(Some(q)),
            None => Self::Stdin(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn next(&mut self) -> Option<String> {
        match self {
            Self::Single(q) => q.take(),
            Self::Stdin(lines) => loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => return Some(line),
                    Ok(None) => return None,
                    Err(e) => {
                        eprintln!("error: failed to read stdin: {e}");
                        return None;
                    }
                }
            },
        }
    }
}
