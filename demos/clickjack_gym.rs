//! Clickjack gym: replays common deceptive-UI scenarios against the engine.
//!
//! Run with: cargo run --example clickjack_gym -- --mode strict
//!
//! Set `RUST_LOG=navsentinel=debug` to watch allowance grants and ledger traffic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;

use navsentinel::protocol::{TransitionQualifier, TransitionType};
use navsentinel::scoring::{Rect, Viewport};
use navsentinel::signals::{ComputedStyle, NodeId};
use navsentinel::{
    BackgroundMessage, ClickEvent, Config, Coordinator, CoordinatorActor, CoordinatorEvent,
    DirectAdapter, DomElement, HitTestSurface, MemoryAllowlist, MemorySettings, Mode,
    NavigationCall, NavigationCommit, PageController, PageDeps, PointerEventData, Prompt,
    PromptSurface, RecordingSink, Settings, SystemClock, TabDriver, TabId,
};

const GYM: &str = "https://gym.example/";

struct Scene {
    stack: Vec<DomElement>,
}

impl HitTestSurface for Scene {
    fn viewport(&self) -> Viewport {
        Rect::new(1280.0, 720.0)
    }

    fn elements_from_point(&self, _x: f64, _y: f64) -> Vec<DomElement> {
        self.stack.clone()
    }

    fn closest_anchor(&self, node: NodeId) -> Option<DomElement> {
        self.stack
            .iter()
            .find(|el| el.node_id == node && el.tag == "A")
            .cloned()
    }

    fn base_url(&self) -> Option<Url> {
        Url::parse(GYM).ok()
    }
}

struct ConsolePrompts;

impl PromptSurface for ConsolePrompts {
    fn show(&self, prompt: Prompt) {
        let labels: Vec<_> = prompt.actions.iter().map(|a| a.label.as_str()).collect();
        println!(
            "    prompt: {} {} {:?}",
            prompt.message,
            prompt.detail.as_deref().unwrap_or(""),
            labels
        );
    }
}

struct ConsoleDriver;

#[async_trait]
impl TabDriver for ConsoleDriver {
    async fn send_to_page(&self, tab: TabId, message: BackgroundMessage) -> navsentinel::Result<()> {
        println!("    background -> tab {}: {:?}", tab, message);
        Ok(())
    }
}

fn link() -> DomElement {
    DomElement::new(1, "a")
        .with_attr("href", "/article")
        .with_text("Continue reading")
        .with_rect(200.0, 24.0)
}

fn scenes() -> Vec<(&'static str, Vec<DomElement>)> {
    let overlay = DomElement::new(2, "div")
        .with_attr("onclick", "openAd()")
        .with_rect(1280.0, 720.0)
        .with_style(ComputedStyle {
            opacity: Some("0.01".into()),
            position: Some("fixed".into()),
            z_index: Some("99999".into()),
            ..Default::default()
        });
    let blank_link = DomElement::new(3, "a")
        .with_attr("href", "https://docs.example/guide")
        .with_attr("target", "_blank")
        .with_text("Open the guide")
        .with_rect(160.0, 24.0);

    vec![
        ("plain link", vec![link()]),
        ("transparent overlay", vec![overlay, link()]),
        ("target=_blank link", vec![blank_link]),
    ]
}

fn page(mode: Mode, stack: Vec<DomElement>) -> anyhow::Result<PageController> {
    let (tx, _background) = mpsc::unbounded_channel();
    let deps = PageDeps {
        settings: Arc::new(MemorySettings::new(Settings {
            mode,
            ..Settings::default()
        })),
        allowlist: Arc::new(MemoryAllowlist::default()),
        prompts: Arc::new(ConsolePrompts),
        sink: Arc::new(RecordingSink::new(GYM)),
        surface: Arc::new(Scene { stack }),
        clock: Arc::new(SystemClock),
    };
    let page = PageController::new(&Config::default(), Url::parse(GYM)?, true, deps, tx)?;
    page.start(&DirectAdapter);
    Ok(page)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut mode = Mode::Permissive;
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--mode" || args[i] == "-m" {
            i += 1;
            if let Some(value) = args.get(i) {
                mode = value.parse()?;
            }
        }
        i += 1;
    }
    println!("mode: {}", mode);

    for (name, stack) in scenes() {
        println!("\n== {} ==", name);
        let page = page(mode, stack)?;
        page.on_pointer_down(PointerEventData::at(640.0, 360.0));
        let disposition = page.on_click(ClickEvent::at(640.0, 360.0));
        println!(
            "    click: {:?} cds={} reasons={:?}",
            disposition.verdict.decision,
            disposition.verdict.score.cds,
            disposition.verdict.score.reason_codes
        );

        let outcome = page.navigate(NavigationCall::WindowOpen {
            url: Some("https://ads.example/popunder".into()),
            target: None,
            features: Some("width=1,height=1".into()),
        })?;
        println!("    scripted popup: {:?}", outcome);
    }

    println!("\n== delayed redirect ==");
    let settings = MemorySettings::new(Settings::default());
    let coordinator = Coordinator::new(Config::default().coordinator, Arc::new(SystemClock));
    let (actor, handle) =
        CoordinatorActor::new(coordinator, Arc::new(ConsoleDriver), &settings, None)?;
    let task = tokio::spawn(actor.run());

    handle.send(CoordinatorEvent::TabOpened(1)).await?;
    handle
        .from_page(1, navsentinel::PageMessage::Ready)
        .await?;
    handle
        .committed(
            1,
            NavigationCommit::top("https://ads.example/landing", TransitionType::Link)
                .with_qualifier(TransitionQualifier::ClientRedirect),
        )
        .await?;
    drop(handle);

    let coordinator = task.await?;
    println!("    tab 1 phase: {:?}", coordinator.phase(1)?);
    Ok(())
}
