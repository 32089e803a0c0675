//! Stealth Chromium launch: a real browser configured so neither the CDP
//! wiring nor the usual headless tells are visible to page scripts.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use diary_core::{ClientSettings, NetworkError};
use futures::StreamExt;
use tokio::task::JoinHandle;

/// A current desktop Chrome user agent, kept in step with the impersonation
/// profile of the HTTP strategy.
const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/136.0.0.0 Safari/537.36";

const BROWSER_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-blink-features=AutomationControlled",
    "--disable-extensions",
    "--disable-infobars",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    // Use the system resolver, the built-in one is a known automation tell.
    "--disable-async-dns",
    "--lang=ru-RU,ru",
];

/// Scripts injected before any page script runs. Each patches one signal
/// that page-level detection is known to read.
const STEALTH_SCRIPTS: &[&str] = &[
    // navigator.webdriver is the first thing every detector checks.
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined});",
    // Headless Chrome ships without chrome.runtime.
    "if (!window.chrome) { window.chrome = {}; }
     if (!window.chrome.runtime) {
         window.chrome.runtime = { connect: function() {}, sendMessage: function() {} };
     }",
    // Headless answers 'denied' for notification permission queries.
    "const origQuery = window.navigator.permissions.query;
     window.navigator.permissions.query = (params) => (
         params.name === 'notifications'
             ? Promise.resolve({ state: Notification.permission })
             : origQuery(params)
     );",
    // An empty plugin list gives headless away.
    "Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });",
    "Object.defineProperty(navigator, 'languages', { get: () => ['ru-RU', 'ru', 'en-US', 'en'] });",
];

/// Whether a Chromium executable can be located on this host. Checked once
/// at startup to decide if the browser strategy gets registered at all.
pub(crate) fn chromium_available() -> bool {
    BrowserConfig::builder().build().is_ok()
}

/// A launched stealth browser together with its CDP event pump.
pub(crate) struct StealthBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl StealthBrowser {
    /// Launch Chromium with the anti-automation configuration.
    pub(crate) async fn launch(settings: &ClientSettings) -> Result<Self, NetworkError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1280, 800)
            .launch_timeout(settings.browser_launch_timeout)
            .args(BROWSER_ARGS.iter().copied());
        if !settings.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|message| NetworkError::Internal { message })?;

        let (browser, mut handler) = tokio::time::timeout(
            settings.browser_launch_timeout,
            Browser::launch(config),
        )
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|err| NetworkError::Transport {
            message: err.to_string(),
        })?;

        // The handler is the CDP message pump; the browser is unusable the
        // moment it stops being polled.
        let handler_task = tokio::task::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        tracing::info!(
            headless = settings.headless,
            stealth = settings.stealth,
            "stealth browser launched"
        );
        Ok(Self {
            browser,
            handler_task,
        })
    }

    /// Open a page with the stealth scripts, headers and timezone applied.
    pub(crate) async fn new_stealth_page(
        &self,
        settings: &ClientSettings,
    ) -> Result<Page, NetworkError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|err| NetworkError::Transport {
                message: err.to_string(),
            })?;

        let prepare = async {
            page.set_user_agent(CHROME_UA).await?;
            page.execute(SetTimezoneOverrideParams::new("Europe/Moscow"))
                .await?;
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(
                serde_json::json!({
                    "Accept-Language": "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7",
                }),
            )))
            .await?;
            if settings.stealth {
                for script in STEALTH_SCRIPTS {
                    page.execute(AddScriptToEvaluateOnNewDocumentParams::new(*script))
                        .await?;
                }
            }
            Ok::<(), chromiumoxide::error::CdpError>(())
        };

        prepare.await.map_err(|err| NetworkError::Transport {
            message: err.to_string(),
        })?;

        Ok(page)
    }

    /// Close everything, best-effort: a half-dead browser must never mask
    /// the failure that led here, so every close error is swallowed.
    pub(crate) async fn teardown(mut self) {
        if let Err(err) = self.browser.close().await {
            tracing::debug!(%err, "browser close failed");
        }
        if let Err(err) = self.browser.wait().await {
            tracing::debug!(%err, "browser wait failed");
        }
        self.handler_task.abort();
        tracing::debug!("stealth browser closed");
    }
}
