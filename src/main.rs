//! Interactive marketplace chat client
//!
//! Reads one command per line from stdin. Buyer, seller and admin sessions are kept side by
//! side; `as <role>` switches which one the following commands act for.

use market_chat::api::{self, CurrentUser};
use market_chat::config::ChatConfig;
use market_chat::core::controller::ChatHandle;
use market_chat::core::models::{Attachment, Credentials, Product, Role};
use market_chat::core::services::MyMarketplaceService;
use market_chat::core::session::SessionStores;
use market_chat::core::state::ThreadStatus;
use market_chat::core::traits::MarketplaceService;
use market_chat::infrastructure::auth::DbAuthBackend;
use market_chat::infrastructure::database::DatabaseConnection;
use market_chat::infrastructure::realtime::ChangeFeed;
use market_chat::infrastructure::repositories::{
    DbConversationRepository, DbMessageRepository, DbProductRepository,
};
use market_chat::infrastructure::session_storage::FileSessionStorage;
use market_chat::infrastructure::storage::LocalObjectStorage;
use market_chat::infrastructure::traits::{AuthBackend, SessionStorage};

use anyhow::{Context, anyhow, bail};
use di::{Injectable, Ref, ServiceCollection};
use log::info;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::{Builder, Runtime};
use uuid::Uuid;

const HELP: &str = "\
commands:
  signup <role> <email> <password> <name...>   create an account and sign in
  login <role> <email> <password>              sign in
  logout [role]                                sign out
  as <role>                                    act as another signed-in role
  whoami                                       show the signed-in roles
  products [mine]                              list the catalog
  sell <price> <title...>                      list a product (seller)
  contact <n>                                  message the seller of product n
  list                                         show conversations
  open <n>                                     open conversation n
  back                                         close the conversation
  show                                         show the open conversation
  send <text...>                               send a message
  attach <file> [caption...]                   send a file
  retry <id> | discard <id>                    handle a failed message
  refresh                                      reload and reconnect
  quit";

/// How long commands wait for a send to settle before printing.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(client_task())
}

async fn client_task() -> anyhow::Result<()> {
    let provider = ServiceCollection::new()
        .add(ChatConfig::singleton())
        .add(DatabaseConnection::singleton())
        .add(ChangeFeed::singleton())
        .add(DbConversationRepository::singleton())
        .add(DbMessageRepository::singleton())
        .add(DbProductRepository::singleton())
        .add(LocalObjectStorage::singleton())
        .add(DbAuthBackend::singleton())
        .add(FileSessionStorage::singleton())
        .add(MyMarketplaceService::singleton())
        .build_provider()
        .map_err(|e| anyhow!("invalid service configuration: {e}"))?;

    let config = provider.get_required::<ChatConfig>();
    let database = provider.get_required::<DatabaseConnection>();
    database
        .migrate()
        .await
        .with_context(|| format!("migrating {}", config.database_url))?;
    info!("using database {}", config.database_url);

    let sessions = SessionStores::new(
        &config.session_namespace,
        provider.get_required::<dyn AuthBackend>(),
        provider.get_required::<dyn SessionStorage>(),
    );
    sessions.restore_all().await;

    let mut client = Client {
        sessions,
        service: provider.get_required::<dyn MarketplaceService>(),
        role: Role::Buyer,
        chats: HashMap::new(),
        catalog: Vec::new(),
    };

    for role in Role::ALL {
        if client.sessions.current_identity(role).is_some() {
            client.role = role;
            client.start_chat(role).await?;
        }
    }

    println!("{HELP}");
    prompt(client.role);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match client.execute(line.trim()).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => println!("error: {e:#}"),
        }
        prompt(client.role);
    }

    for chat in client.chats.values() {
        chat.teardown().await;
    }
    info!("Shutting down...");
    Ok(())
}

fn prompt(role: Role) {
    print!("{role}> ");
    let _ = std::io::stdout().flush();
}

enum Flow {
    Continue,
    Quit,
}

struct Client {
    sessions: SessionStores,
    service: Ref<dyn MarketplaceService>,
    role: Role,
    chats: HashMap<Role, ChatHandle>,
    catalog: Vec<Product>,
}

impl Client {
    async fn execute(&mut self, line: &str) -> anyhow::Result<Flow> {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        match command {
            "" => {}
            "help" => println!("{HELP}"),
            "quit" | "exit" => return Ok(Flow::Quit),
            "signup" => {
                let [role, email, password, name @ ..] = args.as_slice() else {
                    bail!("usage: signup <role> <email> <password> <name...>");
                };
                if name.is_empty() {
                    bail!("usage: signup <role> <email> <password> <name...>");
                }
                let role: Role = role.parse()?;
                let identity = self
                    .sessions
                    .get(role)
                    .sign_up(&name.join(" "), Credentials::new(*email, *password))
                    .await?;
                println!("welcome, {}", identity.display_name);
                self.role = role;
                self.start_chat(role).await?;
            }
            "login" => {
                let [role, email, password] = args.as_slice() else {
                    bail!("usage: login <role> <email> <password>");
                };
                let role: Role = role.parse()?;
                let identity = self
                    .sessions
                    .sign_in(role, &Credentials::new(*email, *password))
                    .await?;
                println!("signed in as {} ({role})", identity.display_name);
                self.role = role;
                self.start_chat(role).await?;
            }
            "logout" => {
                let role = match args.first() {
                    Some(role) => role.parse()?,
                    None => self.role,
                };
                if let Some(chat) = self.chats.remove(&role) {
                    chat.teardown().await;
                }
                self.sessions.sign_out(role).await;
                println!("signed out of {role}");
            }
            "as" => {
                let role: Role = args.first().context("usage: as <role>")?.parse()?;
                self.role = role;
                if self.sessions.current_identity(role).is_none() {
                    println!("{role} is not signed in");
                }
            }
            "whoami" => {
                for role in Role::ALL {
                    match self.sessions.current_identity(role) {
                        Some(identity) => {
                            println!("{role}: {} <{}>", identity.display_name, identity.email)
                        }
                        None => println!("{role}: signed out"),
                    }
                }
            }
            "products" => {
                let seller = match args.first() {
                    Some(&"mine") => Some(self.current_user()?.0.id),
                    _ => None,
                };
                self.catalog = self.service.list_products(seller).await?;
                if self.catalog.is_empty() {
                    println!("no products");
                }
                for (index, product) in self.catalog.iter().enumerate() {
                    println!(
                        "{}. {} {} (sold by {})",
                        index + 1,
                        product.title,
                        api::format_price(product.price_cents),
                        product.seller_name
                    );
                }
            }
            "sell" => {
                let (price, title) = rest.split_once(' ').context("usage: sell <price> <title...>")?;
                let price_cents = api::parse_price(price)?;
                let CurrentUser(seller) = self.current_user()?;
                let product = self
                    .service
                    .create_product(&seller, title.trim().to_owned(), price_cents)
                    .await?;
                println!("listed {} for {}", product.title, api::format_price(product.price_cents));
            }
            "contact" => {
                let product = self
                    .catalog
                    .get(parse_index(args.first())?)
                    .context("unknown product, run `products` first")?
                    .clone();
                let chat = self.chat()?;
                chat.open_conversation(product.seller_id, Some(product.id))
                    .await?;
                self.print_thread().await?;
            }
            "list" => {
                let chat = self.chat()?;
                print!("{}", api::conversations::render_list(&chat.state()));
            }
            "open" => {
                let chat = self.chat()?;
                let index = parse_index(args.first())?;
                let conversation_id = chat
                    .state()
                    .conversations()
                    .get(index)
                    .map(|entry| entry.conversation.id)
                    .context("unknown conversation, run `list` first")?;
                chat.select_conversation(Some(conversation_id)).await?;
                self.print_thread().await?;
            }
            "back" => {
                self.chat()?.select_conversation(None).await?;
            }
            "show" => self.print_thread().await?,
            "send" => {
                let chat = self.chat()?;
                let conversation_id = self.active_conversation()?;
                let temp_id = chat.send_message(conversation_id, rest).await?;
                self.settle(temp_id).await?;
            }
            "attach" => {
                let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
                if path.is_empty() {
                    bail!("usage: attach <file> [caption...]");
                }
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {path}"))?;
                let file_name = Path::new(path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_owned());
                let chat = self.chat()?;
                let conversation_id = self.active_conversation()?;
                let temp_id = chat
                    .send_message_with_attachment(
                        conversation_id,
                        caption.trim(),
                        Attachment { file_name, bytes },
                    )
                    .await?;
                self.settle(temp_id).await?;
            }
            "retry" => {
                let temp_id = parse_id(args.first())?;
                self.chat()?.retry_message(temp_id).await?;
                self.settle(temp_id).await?;
            }
            "discard" => {
                let temp_id = parse_id(args.first())?;
                self.chat()?.discard_message(temp_id).await?;
                self.print_thread().await?;
            }
            "refresh" => {
                self.chat()?.refresh().await?;
                println!("refreshing");
            }
            other => println!("unknown command `{other}`, try `help`"),
        }

        Ok(Flow::Continue)
    }

    async fn start_chat(&mut self, role: Role) -> anyhow::Result<()> {
        let CurrentUser(identity) = CurrentUser::extract(&self.sessions, role)?;
        if let Some(previous) = self.chats.remove(&role) {
            previous.teardown().await;
        }
        let chat = self.service.start_chat(&identity).await?;
        self.chats.insert(role, chat);
        Ok(())
    }

    fn current_user(&self) -> anyhow::Result<CurrentUser> {
        Ok(CurrentUser::extract(&self.sessions, self.role)?)
    }

    fn chat(&self) -> anyhow::Result<ChatHandle> {
        self.current_user()?;
        self.chats
            .get(&self.role)
            .cloned()
            .with_context(|| format!("no chat running for {}", self.role))
    }

    fn active_conversation(&self) -> anyhow::Result<Uuid> {
        self.chat()?
            .state()
            .active_conversation()
            .context("open a conversation first")
    }

    async fn print_thread(&self) -> anyhow::Result<()> {
        let chat = self.chat()?;
        let state = tokio::time::timeout(
            SETTLE_TIMEOUT,
            chat.wait_for(|state| *state.thread_status() != ThreadStatus::LoadingHistory),
        )
        .await
        .unwrap_or_else(|_| Ok(chat.state()))?;
        print!("{}", api::messages::render_thread(&state));
        Ok(())
    }

    /// Waits until the send of `temp_id` is acknowledged or failed, then prints the thread.
    async fn settle(&self, temp_id: Uuid) -> anyhow::Result<()> {
        let chat = self.chat()?;
        let settled = tokio::time::timeout(
            SETTLE_TIMEOUT,
            chat.wait_for(|state| {
                !state
                    .thread()
                    .iter()
                    .any(|message| message.temp_id() == Some(temp_id) && message.is_pending())
            }),
        )
        .await;
        if settled.is_err() {
            println!("still sending...");
        }
        self.print_thread().await
    }
}

/// 1-based position as typed by the user.
fn parse_index(arg: Option<&&str>) -> anyhow::Result<usize> {
    let position: usize = arg.context("missing number")?.parse()?;
    position.checked_sub(1).context("numbers start at 1")
}

fn parse_id(arg: Option<&&str>) -> anyhow::Result<Uuid> {
    Ok(arg.context("missing message id")?.parse()?)
}
