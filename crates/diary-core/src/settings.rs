use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Basic client behavior settings. These specify the provider targets, the
/// per-step time budgets and the tunable policies of the SDK. They are
/// optional and uneditable once a client is initialized.
///
/// Defaults to
///
/// ```
/// # use std::time::Duration;
/// # use diary_core::ClientSettings;
/// let settings = ClientSettings {
///     entry_url: "https://school.mos.ru".to_string(),
///     auth_url: "https://login.mos.ru".to_string(),
///     user_agent: "diary-sdk".to_string(),
///     probe_timeout: Duration::from_secs(3),
///     login_timeout: Duration::from_secs(10),
///     verify_timeout: Duration::from_secs(90),
///     browser_launch_timeout: Duration::from_secs(30),
///     page_load_timeout: Duration::from_secs(60),
///     redirect_timeout: Duration::from_secs(30),
///     input_timeout: Duration::from_secs(30),
///     token_wait_timeout: Duration::from_secs(30),
///     login_retry_limit: 1,
///     token_lifetime: Duration::from_secs(24 * 60 * 60),
///     headless: true,
///     stealth: true,
/// };
/// let default = ClientSettings::default();
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientSettings {
    /// Entry page of the targeted provider instance, also the base of its
    /// API. Defaults to `https://school.mos.ru`.
    pub entry_url: String,
    /// Base URL of the identity-provider login subdomain, also the target of
    /// the reachability probe. Defaults to `https://login.mos.ru`.
    pub auth_url: String,
    /// The user agent sent on direct HTTP calls. Defaults to `diary-sdk`.
    pub user_agent: String,
    /// Budget for the TCP reachability probe.
    pub probe_timeout: Duration,
    /// Per-attempt budget for the password step. The provider usually
    /// answers this step within a few seconds.
    pub login_timeout: Duration,
    /// Budget for the code-verification step, which is observably slower on
    /// the provider side than the password step.
    pub verify_timeout: Duration,
    /// Budget for launching the stealth browser.
    pub browser_launch_timeout: Duration,
    /// Budget for loading the entry page (a SPA that needs a while).
    pub page_load_timeout: Duration,
    /// Budget for the redirect from the entry page to the login subdomain.
    pub redirect_timeout: Duration,
    /// Budget for a form field to become visible.
    pub input_timeout: Duration,
    /// Budget for the token interception signal after code submission.
    pub token_wait_timeout: Duration,
    /// Extra login attempts after a timeout or transport failure. A policy
    /// knob, not a contract: whether retrying under provider-side rate
    /// limiting helps at all is unresolved, set to 0 to disable.
    pub login_retry_limit: u32,
    /// Assumed lifetime of a freshly issued access token. The provider does
    /// not reliably report one, so refresh scheduling works off this value.
    pub token_lifetime: Duration,
    /// Run the browser strategy headless. Defaults to true.
    pub headless: bool,
    /// Apply anti-automation countermeasures to the browser. Defaults to
    /// true.
    pub stealth: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            entry_url: "https://school.mos.ru".into(),
            auth_url: "https://login.mos.ru".into(),
            user_agent: "diary-sdk".into(),
            probe_timeout: Duration::from_secs(3),
            login_timeout: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(90),
            browser_launch_timeout: Duration::from_secs(30),
            page_load_timeout: Duration::from_secs(60),
            redirect_timeout: Duration::from_secs(30),
            input_timeout: Duration::from_secs(30),
            token_wait_timeout: Duration::from_secs(30),
            login_retry_limit: 1,
            token_lifetime: Duration::from_secs(24 * 60 * 60),
            headless: true,
            stealth: true,
        }
    }
}
