//! Browser login strategy. Drives a stealth Chromium through the provider's
//! web login UI and recovers the tokens by watching the page's own network
//! traffic, which sails past every layer of bot detection the HTTP path has
//! to fight.

mod intercept;
mod stealth;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Element, Page};
use diary_core::{
    AuthError, AuthenticationError, ClientSettings, LoginSession, NetworkError, PendingLogin,
    RetryObserver,
};
use regex::Regex;

use crate::{
    api::{ProviderApi, SessionMaterial},
    strategy::{LoginStrategy, StartLoginOutcome, StrategyError},
};
use intercept::ResponseInterceptor;
use stealth::StealthBrowser;

/// The provider does not expose the code TTL anywhere on the page; this is
/// the window it has been observed to honor.
const DEFAULT_CODE_TTL: Duration = Duration::from_secs(300);

/// Quick existence check for fields that may already be on the page.
const QUICK_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause after a submit before scanning for a rejection, so a definite
/// failure is caught without waiting out a full field timeout.
const ERROR_SCAN_DELAY: Duration = Duration::from_millis(1500);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

// Exact attribute matches come first; the placeholder and bare-type
// heuristics only get a say when nothing exact is present.
const LOGIN_FIELD_SELECTORS: &[&str] = &[
    "input[name='login']",
    "input[id*='login' i]",
    "input[placeholder*='логин' i]",
    "input[placeholder*='Login' i]",
    "input[type='text']",
];

const PASSWORD_FIELD_SELECTORS: &[&str] = &["input[type='password']", "input[name='password']"];

const CODE_FIELD_SELECTORS: &[&str] = &[
    "input[autocomplete='one-time-code']",
    "input[name='code']",
    "input[name='smsCode']",
    "input[placeholder*='код' i]",
    "input[placeholder*='code' i]",
];

const SUBMIT_SELECTORS: &[&str] = &[
    "button[type='submit']",
    "button.btn-primary",
    "button.login-btn",
    "input[type='submit']",
];

const ERROR_SELECTORS: &[&str] = &[
    ".error-message",
    ".alert-danger",
    ".notification-error",
    "[class*='error' i]:not(script):not(style)",
    "[class*='invalid' i]:not(script):not(style)",
];

const IDP_BUTTON_SELECTORS: &[&str] = &["div[class*='btn']"];

/// Clicks the identity-provider button by its visible label when none of the
/// CSS guesses hit.
const IDP_BUTTON_TEXT_CLICK: &str = r#"
(() => {
    const nodes = document.querySelectorAll('button, a, div');
    for (const node of nodes) {
        if (node.innerText && node.innerText.trim() === 'МЭШID') {
            node.click();
            return true;
        }
    }
    return false;
})()
"#;

/// Login strategy that drives a real, stealth-configured browser.
pub struct AutomatedBrowserClient {
    settings: Arc<ClientSettings>,
    api: Arc<ProviderApi>,
    auth_host: String,
}

impl AutomatedBrowserClient {
    /// Build the strategy against the configured provider.
    pub fn new(settings: Arc<ClientSettings>) -> Result<Self, NetworkError> {
        let api = Arc::new(ProviderApi::build(&settings)?);
        let auth_host = url::Url::parse(&settings.auth_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| settings.auth_url.clone());
        Ok(Self {
            settings,
            api,
            auth_host,
        })
    }

    /// Whether this strategy's runtime dependency (a Chromium executable) is
    /// present on this host.
    pub fn available() -> bool {
        stealth::chromium_available()
    }

    async fn drive_login(
        &self,
        browser: &StealthBrowser,
        login: &str,
        password: &str,
    ) -> Result<DriveOutcome, StrategyError> {
        let page = browser
            .new_stealth_page(&self.settings)
            .await
            .map_err(StrategyError::Network)?;

        // Attached before navigation so the registration response, which the
        // page fires immediately, is not missed.
        let interceptor = ResponseInterceptor::attach(&page)
            .await
            .map_err(StrategyError::Network)?;

        self.goto_entry(&page).await;

        if !self.on_auth_host(&page).await {
            self.click_idp_button(&page).await;
            self.wait_for_auth_redirect(&page).await;
        }

        // No login field at all means the page never loaded its form: the
        // one failure worth handing to the other strategy.
        let Some(login_field) =
            find_input(&page, LOGIN_FIELD_SELECTORS, self.settings.input_timeout).await
        else {
            return Err(StrategyError::PageNotLoaded(
                "the login field never rendered".into(),
            ));
        };
        fill(&login_field, login).await?;
        tracing::debug!("login filled");

        // The current flow shows both fields on one page; the older one
        // reveals the password field only after the login is submitted.
        let password_field =
            match find_input(&page, PASSWORD_FIELD_SELECTORS, QUICK_CHECK_TIMEOUT).await {
                Some(field) => field,
                None => {
                    self.submit(&page).await?;
                    match find_input(&page, PASSWORD_FIELD_SELECTORS, self.settings.input_timeout)
                        .await
                    {
                        Some(field) => field,
                        None => {
                            self.fail_on_page_error(&page).await?;
                            return Err(StrategyError::Network(NetworkError::PageStructure {
                                message: "the password field never appeared".into(),
                            }));
                        }
                    }
                }
            };
        fill(&password_field, password).await?;
        tracing::debug!("password filled");
        self.submit(&page).await?;

        tokio::time::sleep(ERROR_SCAN_DELAY).await;
        self.fail_on_page_error(&page).await?;

        match find_input(&page, CODE_FIELD_SELECTORS, self.settings.input_timeout).await {
            Some(_) => {
                let masked_contact = masked_contact_in(&page_text(&page).await)
                    .unwrap_or_else(|| "your phone".to_string());
                tracing::info!(%masked_contact, "code step reached");
                Ok(DriveOutcome::SmsRequired {
                    masked_contact,
                    page,
                    interceptor,
                })
            }
            None if interceptor.has_token() => {
                // Rare no-code path: the exchange already played out.
                tracing::info!("login completed without a code step");
                Ok(DriveOutcome::Authenticated(interceptor.material()))
            }
            None => Err(StrategyError::Network(NetworkError::PageStructure {
                message: "the code step never appeared".into(),
            })),
        }
    }

    /// Load the entry page. Slow SPA loads are tolerated: the field polls
    /// that follow are the real readiness check.
    async fn goto_entry(&self, page: &Page) {
        tracing::info!(url = %self.settings.entry_url, "opening entry page");
        match tokio::time::timeout(
            self.settings.page_load_timeout,
            page.goto(self.settings.entry_url.clone()),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::debug!(%err, "goto reported an error, continuing"),
            Err(_) => tracing::debug!("goto timed out, continuing"),
        }
    }

    async fn on_auth_host(&self, page: &Page) -> bool {
        current_url(page)
            .await
            .map(|u| u.contains(&self.auth_host))
            .unwrap_or(false)
    }

    async fn click_idp_button(&self, page: &Page) {
        for selector in IDP_BUTTON_SELECTORS {
            if let Ok(element) = page.find_element(*selector).await {
                if element.click().await.is_ok() {
                    tracing::debug!(selector = *selector, "identity-provider button clicked");
                    return;
                }
            }
        }
        match page.evaluate(IDP_BUTTON_TEXT_CLICK).await {
            Ok(result) if result.into_value::<bool>().unwrap_or(false) => {
                tracing::debug!("identity-provider button clicked via text lookup");
            }
            _ => tracing::warn!("identity-provider button not found"),
        }
    }

    /// Poll the URL until the login subdomain shows up. Only the URL is
    /// awaited, not the full load: the form polls handle the rest.
    async fn wait_for_auth_redirect(&self, page: &Page) {
        let deadline = tokio::time::Instant::now() + self.settings.redirect_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.on_auth_host(page).await {
                tracing::debug!(host = %self.auth_host, "redirected to the login subdomain");
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        tracing::warn!(
            host = %self.auth_host,
            "the login subdomain never showed up, continuing on the current page"
        );
    }

    async fn submit(&self, page: &Page) -> Result<(), StrategyError> {
        for selector in SUBMIT_SELECTORS {
            if let Ok(element) = page.find_element(*selector).await {
                if element.click().await.is_ok() {
                    return Ok(());
                }
            }
        }
        // No recognizable button; Enter on the focused field does the same.
        if let Ok(element) = page.find_element("input:focus").await {
            let _ = element.press_key("Enter").await;
        }
        Ok(())
    }

    /// Scan the page for a rendered rejection and fail fast on one.
    async fn fail_on_page_error(&self, page: &Page) -> Result<(), StrategyError> {
        if let Some(text) = visible_error_text(page).await {
            tracing::warn!(%text, "provider rejected the login");
            return Err(StrategyError::Authentication(
                AuthenticationError::BadCredentials,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LoginStrategy for AutomatedBrowserClient {
    fn name(&self) -> &'static str {
        "automated-browser"
    }

    #[tracing::instrument(skip_all)]
    async fn start_login(
        &self,
        login: &str,
        password: &str,
        _observer: Option<Arc<dyn RetryObserver>>,
    ) -> Result<StartLoginOutcome, StrategyError> {
        if !Self::available() {
            return Err(StrategyError::Unavailable("chromium executable not found"));
        }

        let browser = StealthBrowser::launch(&self.settings)
            .await
            .map_err(StrategyError::Network)?;

        match self.drive_login(&browser, login, password).await {
            Ok(DriveOutcome::Authenticated(material)) => {
                browser.teardown().await;
                let session = self.api.finalize(material).await.map_err(StrategyError::from)?;
                Ok(StartLoginOutcome::Authenticated(session))
            }
            Ok(DriveOutcome::SmsRequired {
                masked_contact,
                page,
                interceptor,
            }) => Ok(StartLoginOutcome::SmsRequired {
                masked_contact,
                code_ttl: DEFAULT_CODE_TTL,
                continuation: Box::new(BrowserPendingLogin {
                    browser: Some(browser),
                    page,
                    interceptor,
                    api: Arc::clone(&self.api),
                    settings: Arc::clone(&self.settings),
                }),
            }),
            Err(err) => {
                browser.teardown().await;
                Err(err)
            }
        }
    }
}

enum DriveOutcome {
    Authenticated(SessionMaterial),
    SmsRequired {
        masked_contact: String,
        page: Page,
        interceptor: ResponseInterceptor,
    },
}

/// A login parked on an open browser page showing the code prompt.
struct BrowserPendingLogin {
    browser: Option<StealthBrowser>,
    page: Page,
    interceptor: ResponseInterceptor,
    api: Arc<ProviderApi>,
    settings: Arc<ClientSettings>,
}

#[async_trait]
impl PendingLogin for BrowserPendingLogin {
    #[tracing::instrument(skip_all)]
    async fn verify_code(&mut self, code: &str) -> Result<LoginSession, AuthError> {
        if self.browser.is_none() {
            return Err(AuthenticationError::SessionExpired.into());
        }

        let Some(code_field) = find_input(&self.page, CODE_FIELD_SELECTORS, QUICK_CHECK_TIMEOUT).await
        else {
            return Err(NetworkError::PageStructure {
                message: "the code field is no longer on the page".into(),
            }
            .into());
        };
        fill(&code_field, code).await.map_err(AuthError::from)?;

        for selector in SUBMIT_SELECTORS {
            if let Ok(element) = self.page.find_element(*selector).await {
                if element.click().await.is_ok() {
                    break;
                }
            }
        }

        tokio::time::sleep(ERROR_SCAN_DELAY).await;
        self.check_code_rejection().await?;

        // The token exchange is the real confirmation; the page itself never
        // says "done".
        if !self
            .interceptor
            .wait_for_completion(self.settings.token_wait_timeout)
            .await
        {
            // The browser stays open: the same code may still be accepted on
            // a resubmission.
            return Err(NetworkError::TokenWaitTimeout.into());
        }

        let session = self.api.finalize(self.interceptor.material()).await?;

        if let Some(browser) = self.browser.take() {
            browser.teardown().await;
        }
        Ok(session)
    }

    async fn cancel(&mut self) {
        if let Some(browser) = self.browser.take() {
            browser.teardown().await;
        }
    }

    fn strategy(&self) -> &'static str {
        "automated-browser"
    }
}

impl BrowserPendingLogin {
    /// Distinguish a rejected code (recoverable, the field stays) from an
    /// expired one (the whole login has to restart).
    async fn check_code_rejection(&self) -> Result<(), AuthError> {
        if let Some(text) = visible_error_text(&self.page).await {
            tracing::warn!(%text, "provider rejected the code");
            let lowered = text.to_lowercase();
            if ["код истёк", "код истек", "code expired"]
                .iter()
                .any(|marker| lowered.contains(marker))
            {
                return Err(AuthenticationError::SessionExpired.into());
            }
            return Err(AuthenticationError::BadCode.into());
        }

        let body = page_text(&self.page).await.to_lowercase();
        if ["код истёк", "код истек", "code expired"]
            .iter()
            .any(|marker| body.contains(marker))
        {
            return Err(AuthenticationError::SessionExpired.into());
        }
        if ["неверный код", "invalid code"]
            .iter()
            .any(|marker| body.contains(marker))
        {
            return Err(AuthenticationError::BadCode.into());
        }
        Ok(())
    }
}

/// Walk the selector list in priority order until one matches, polling up to
/// `timeout` for slow pages.
async fn find_input(page: &Page, selectors: &[&str], timeout: Duration) -> Option<Element> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for selector in selectors {
            if let Ok(element) = page.find_element(*selector).await {
                return Some(element);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn fill(element: &Element, value: &str) -> Result<(), StrategyError> {
    let typed = async {
        element.click().await?;
        element.type_str(value).await?;
        Ok::<(), chromiumoxide::error::CdpError>(())
    };
    typed.await.map_err(|err| {
        StrategyError::Network(NetworkError::Transport {
            message: err.to_string(),
        })
    })
}

async fn current_url(page: &Page) -> Option<String> {
    page.url().await.ok().flatten()
}

async fn page_text(page: &Page) -> String {
    page.evaluate("document.body ? document.body.innerText : ''")
        .await
        .ok()
        .and_then(|result| result.into_value::<String>().ok())
        .unwrap_or_default()
}

/// First visible, plausibly-sized error message on the page, if any.
async fn visible_error_text(page: &Page) -> Option<String> {
    for selector in ERROR_SELECTORS {
        let Ok(element) = page.find_element(*selector).await else {
            continue;
        };
        let Ok(Some(text)) = element.inner_text().await else {
            continue;
        };
        let text = text.trim().to_string();
        // Anything shorter is an icon or a stray class hit, anything longer
        // is the page's whole layout matching a greedy selector.
        if text.len() > 5 && text.len() < 300 {
            return Some(text);
        }
    }
    None
}

/// Pull a masked phone number out of the code-step page text.
fn masked_contact_in(text: &str) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"\+?7[\s\-\(]*[\*\d]{3,}[\s\-\)]*\d{2,4}",
            r"\d\*{3,}\d{2,4}",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("patterns are valid"))
        .collect()
    });
    patterns
        .iter()
        .find_map(|re| re.find(text).map(|m| m.as_str().trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_contact_is_extracted_from_page_text() {
        let text = "Мы отправили код на номер +7 915***99. Введите его ниже.";
        assert_eq!(masked_contact_in(text).as_deref(), Some("+7 915***99"));

        let text = "Код отправлен на 7***99";
        assert_eq!(masked_contact_in(text).as_deref(), Some("7***99"));
    }

    #[test]
    fn pages_without_a_number_yield_nothing() {
        assert_eq!(masked_contact_in("Введите код из SMS"), None);
    }

    #[test]
    fn exact_selectors_come_before_heuristics() {
        // The priority contract the field lookup relies on: exact attribute
        // matches first, bare-type guesses last.
        assert_eq!(LOGIN_FIELD_SELECTORS.first(), Some(&"input[name='login']"));
        assert_eq!(
            LOGIN_FIELD_SELECTORS.last(),
            Some(&"input[type='text']")
        );
        assert_eq!(
            CODE_FIELD_SELECTORS.first(),
            Some(&"input[autocomplete='one-time-code']")
        );
    }
}
