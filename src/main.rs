#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod credentials;
mod ui;
mod utils;

use crate::{
    credentials::{credentials_path, forget_credentials, load_credentials, save_credentials, Credentials},
    ui::{ChatUI, UiAction},
};
use chitchathub::auth::{AuthError, AuthService};
use chitchathub::config::AppConfig;
use chitchathub::models::LoggedInUser;
use chitchathub::moderation::{GeminiModerator, Moderator, UnavailableModerator};
use chitchathub::session::{ChatSession, Notice, SendError, SessionEvent};
use chitchathub::store::SqliteStore;

const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);
const LOGIN_ATTEMPTS: usize = 3;

/// Command line arguments for ChitChatHub
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ChitChatHub: a terminal direct-messaging client with message moderation."
)]
struct Args {
    /// Configuration file (default: <config dir>/chitchathub/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for the chat database and log file
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Create a new account instead of signing in
    #[arg(long)]
    signup: bool,

    /// Forget the remembered login before starting
    #[arg(long)]
    forget: bool,
}

/// How a chat view ended
enum ChatExit {
    Quit,
    SignedOut,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &args.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    let log_file = config.log_file()?;
    utils::setup_logging(&log_file, config.log_level()?)?;
    info!("ChitChatHub starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", log_file.display());

    let database_path = config.database_path()?;
    let store = Arc::new(
        SqliteStore::open(&database_path)
            .with_context(|| format!("Failed to open chat store at {}", database_path.display()))?,
    );

    let moderator: Arc<dyn Moderator> = match config.moderation.gemini_settings() {
        Some(settings) => Arc::new(GeminiModerator::new(settings)?),
        None => {
            warn!("No moderation API key configured; outgoing messages will be refused");
            eprintln!("Warning: GEMINI_API_KEY is not set. Messages cannot be sent until moderation is configured.");
            Arc::new(UnavailableModerator::new("no moderation API key configured"))
        }
    };

    let auth = AuthService::new(store.clone());
    let saved_login = credentials_path(args.config.as_deref())?;
    if args.forget {
        forget_credentials(&saved_login)?;
    }

    let mut signup = args.signup;
    loop {
        let Some(user) = login(&auth, &saved_login, signup).await? else {
            break;
        };
        signup = false;
        let user_id = user.id().to_string();

        match run_chat(user, &store, &moderator, &config, &auth).await {
            Ok(ChatExit::Quit) => {
                if let Err(e) = auth.sign_out(&user_id).await {
                    error!("Failed to sign out {}: {}", user_id, e);
                }
                break;
            }
            Ok(ChatExit::SignedOut) => {
                println!("Signed out.\n");
            }
            Err(e) => {
                error!("Chat session failed: {:#}", e);
                if let Err(sign_out_error) = auth.sign_out(&user_id).await {
                    error!("Failed to sign out {}: {}", user_id, sign_out_error);
                }
                return Err(e);
            }
        }
    }

    println!("Chat session ended.");
    Ok(())
}

/// Sign in (or up) interactively. Returns `None` when the user gives up.
async fn login(auth: &AuthService, saved_login: &Path, signup: bool) -> Result<Option<LoggedInUser>> {
    if signup {
        return sign_up_prompt(auth, saved_login).await;
    }

    if let (Ok(email), Ok(password)) = (
        std::env::var("CHITCHAT_EMAIL"),
        std::env::var("CHITCHAT_PASSWORD"),
    ) {
        info!("Signing in {} from environment", email);
        return match auth.sign_in(&email, &password).await {
            Ok(user) => Ok(Some(user)),
            Err(e) => Err(anyhow!("Sign-in with CHITCHAT_EMAIL failed: {}", e)),
        };
    }

    if let Some(saved) = load_credentials(saved_login)? {
        if let Some(password) = saved.get_password() {
            match auth.sign_in(&saved.email, &password).await {
                Ok(user) => return Ok(Some(user)),
                Err(e) => {
                    warn!("Saved login for {} was rejected: {}", saved.email, e);
                    eprintln!("Saved login for {} no longer works: {}", saved.email, e);
                }
            }
        }
    }

    for _ in 0..LOGIN_ATTEMPTS {
        let email = utils::prompt("Email (leave empty to create an account)")?;
        if email.is_empty() {
            return sign_up_prompt(auth, saved_login).await;
        }
        let password = utils::prompt("Password")?;
        match auth.sign_in(&email, &password).await {
            Ok(user) => {
                remember(saved_login, &email, &password);
                return Ok(Some(user));
            }
            Err(AuthError::InvalidCredentials) => eprintln!("Invalid email or password."),
            Err(e) => return Err(e.into()),
        }
    }
    eprintln!("Too many failed attempts.");
    Ok(None)
}

async fn sign_up_prompt(auth: &AuthService, saved_login: &Path) -> Result<Option<LoggedInUser>> {
    println!("Create a ChitChatHub account");
    for _ in 0..LOGIN_ATTEMPTS {
        let name = utils::prompt("Display name")?;
        let email = utils::prompt("Email")?;
        let password = utils::prompt("Password (at least 6 characters)")?;
        match auth.sign_up(&name, &email, &password).await {
            Ok(user) => {
                remember(saved_login, &email, &password);
                return Ok(Some(user));
            }
            Err(AuthError::Store(e)) => return Err(e.into()),
            Err(e) => eprintln!("Sign Up Failed: {}", e),
        }
    }
    Ok(None)
}

fn remember(saved_login: &Path, email: &str, password: &str) {
    if let Err(e) = save_credentials(saved_login, &Credentials::new(email, password)) {
        eprintln!("Warning: Failed to save credentials: {}", e);
    }
}

async fn run_chat(
    user: LoggedInUser,
    store: &Arc<SqliteStore>,
    moderator: &Arc<dyn Moderator>,
    config: &AppConfig,
    auth: &AuthService,
) -> Result<ChatExit> {
    let user_id = user.id().to_string();
    let (session, mut events) = ChatSession::start(
        user,
        store.clone(),
        moderator.clone(),
        config.session_options(),
    )
    .await?;
    let session = Arc::new(session);

    let mut terminal = ui::setup_terminal()?;
    let mut chat_ui = ChatUI::new(session.profile());

    let result = run_main_loop(&mut chat_ui, &mut terminal, &session, &mut events, auth, &user_id).await;

    session.close();
    ui::restore_terminal(terminal)?;
    result
}

/// Run the main event loop
async fn run_main_loop(
    chat_ui: &mut ChatUI,
    terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>,
    session: &Arc<ChatSession>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    auth: &AuthService,
    user_id: &str,
) -> Result<ChatExit> {
    // Refusals that happen before the session's own notices kick in
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Notice>();

    loop {
        terminal.draw(|f| chat_ui.draw(f))?;
        chat_ui.clean_notices(NOTICE_TIMEOUT);

        match chat_ui.handle_input()? {
            Some(UiAction::Quit) => return Ok(ChatExit::Quit),
            Some(UiAction::SignOut) => {
                auth.sign_out(user_id).await?;
                return Ok(ChatExit::SignedOut);
            }
            Some(UiAction::Send(text)) => {
                let session = Arc::clone(session);
                let local_tx = local_tx.clone();
                tokio::spawn(async move {
                    match session.send_message(&text).await {
                        Ok(outcome) => info!("Send finished: {:?}", outcome),
                        Err(SendError::Closed) => {}
                        Err(e) => {
                            let _ = local_tx.send(Notice::error("Message not sent", e.to_string()));
                        }
                    }
                });
            }
            Some(UiAction::Select(contact_id)) => {
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    if let Err(e) = session.select_contact(&contact_id).await {
                        warn!("Could not select {}: {}", contact_id, e);
                    }
                });
            }
            Some(UiAction::AddContact(email)) => {
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    if let Err(e) = session.add_contact(&email).await {
                        warn!("Adding contact {} failed: {}", email, e);
                    }
                });
            }
            Some(UiAction::RemoveContact(contact_id)) => {
                let session = Arc::clone(session);
                let local_tx = local_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.remove_contact(&contact_id).await {
                        warn!("Removing contact {} failed: {}", contact_id, e);
                        let _ = local_tx.send(Notice::error("Contact not removed", e.to_string()));
                    }
                });
            }
            Some(UiAction::UpdateAvatar(url)) => {
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    if let Err(e) = session.update_avatar(&url).await {
                        warn!("Avatar update failed: {}", e);
                    }
                });
            }
            Some(UiAction::Search(query)) => {
                let results = session.search_messages(&query);
                chat_ui.set_search_results(&query, results);
            }
            None => {}
        }

        while let Ok(event) = events.try_recv() {
            let signed_out = event == SessionEvent::SignedOut;
            let messages_changed = matches!(event, SessionEvent::MessagesChanged { .. });
            chat_ui.apply_event(event);
            if signed_out {
                terminal.draw(|f| chat_ui.draw(f))?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                return Ok(ChatExit::SignedOut);
            }
            if messages_changed {
                if let Some(query) = chat_ui.search_query() {
                    chat_ui.set_search_results(&query, session.search_messages(&query));
                }
            }
        }

        while let Ok(notice) = local_rx.try_recv() {
            chat_ui.show_notice(notice);
        }
    }
}
