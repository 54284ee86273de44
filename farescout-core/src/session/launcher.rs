use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ScraperConfig;

use super::diagnostics::AttemptLog;
use super::error::{SessionError, SessionResult};
use super::fingerprint::FingerprintMasker;
use super::interceptor::{
    FaultSlot, InterceptStage, RequestInterceptor, RuleCallback, SessionEvent,
};
use super::metrics::SessionMetrics;
use super::outcome::{self, MatchedOutcome, OutcomeSet};
use super::proxy::ProxySelection;
use super::scrape::ScrapeSession;

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const EVENT_BUS_CAPACITY: usize = 256;

/// Navigation and content retrieval over the live page. Outcome matching
/// probes content through this seam, so tests can script it.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> SessionResult<()>;
    async fn content(&self) -> SessionResult<String>;
}

struct ChromiumPageDriver {
    page: Arc<Page>,
}

#[async_trait]
impl PageDriver for ChromiumPageDriver {
    async fn navigate(&self, url: &str) -> SessionResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SessionError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn content(&self) -> SessionResult<String> {
        Ok(self.page.content().await?)
    }
}

/// Everything one attempt hands to the factory: identity for the proxy
/// group, the attempt's event log, and the shared metrics sink.
pub struct LaunchSpec {
    pub scraper: String,
    pub proxy: ProxySelection,
    pub log: AttemptLog,
    pub metrics: Arc<SessionMetrics>,
}

/// Produces one live session per attempt. Implemented by `SessionLauncher`
/// and by scripted factories in tests.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> SessionResult<Box<dyn ScrapeSession>>;
}

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
}

/// Builds chromium launch configuration from the config file and the
/// attempt's proxy resolution, then wires the interception stack onto the
/// fresh page.
#[derive(Debug, Clone)]
pub struct SessionLauncher {
    config: Arc<ScraperConfig>,
    fingerprint: FingerprintMasker,
}

impl SessionLauncher {
    pub fn new(config: Arc<ScraperConfig>) -> Self {
        let fingerprint = FingerprintMasker::new(config.fingerprint.clone());
        Self {
            config,
            fingerprint,
        }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    fn select_viewport(&self) -> ViewportSpec {
        let section = &self.config.viewport;
        let jitter = section.jitter_pixels as i32;
        let mut rng = rand::thread_rng();
        let width = (section.width as i32 + rng.gen_range(-jitter..=jitter)).clamp(640, 2560);
        let height = (section.height as i32 + rng.gen_range(-jitter..=jitter)).clamp(480, 1600);
        ViewportSpec {
            width: width as u32,
            height: height as u32,
        }
    }

    fn select_user_agent(&self) -> String {
        let pool = &self.config.user_agents.pool;
        let mut rng = rand::thread_rng();
        pool.choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
    }

    fn build_chromium_config(
        &self,
        viewport: &ViewportSpec,
        user_agent: &str,
        proxy_arg: Option<&str>,
    ) -> SessionResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: viewport.width >= viewport.height,
            has_touch: false,
        });

        if let Some(path) = &self.config.chromium.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.config.chromium.headless {
            builder = builder.with_head();
        }
        if !self.config.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        builder = builder.request_timeout(Duration::from_secs(
            self.config.chromium.request_timeout_seconds,
        ));
        builder = builder.args(launch_args(&self.config, viewport, user_agent, proxy_arg));

        builder.build().map_err(SessionError::Configuration)
    }

    async fn configure_page(
        &self,
        page: &Page,
        user_agent: &str,
        timezone: Option<&str>,
    ) -> SessionResult<()> {
        page.enable_stealth_mode_with_agent(user_agent).await?;

        let mut ua_builder =
            SetUserAgentOverrideParams::builder().user_agent(user_agent.to_string());
        if let Some(accept) = &self.config.flags.accept_language {
            ua_builder = ua_builder.accept_language(accept.clone());
        }
        page.set_user_agent(ua_builder.build().map_err(SessionError::Configuration)?)
            .await?;

        if let Some(lang) = &self.config.flags.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\n\
                 Object.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en-US'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(SessionError::Configuration)?,
            )
            .await?;
        }

        if let Some(timezone) = timezone {
            page.execute(SetTimezoneOverrideParams::new(timezone.to_string()))
                .await?;
        }

        self.fingerprint.apply(page).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for SessionLauncher {
    async fn launch(&self, spec: LaunchSpec) -> SessionResult<Box<dyn ScrapeSession>> {
        let viewport = self.select_viewport();
        let user_agent = self.select_user_agent();
        let proxy_arg = spec.proxy.record.as_ref().map(|record| record.server_arg());
        info!(
            scraper = %spec.scraper,
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            proxy = proxy_arg.as_deref().unwrap_or("-"),
            "launching chromium session"
        );

        let chromium_config =
            self.build_chromium_config(&viewport, &user_agent, proxy_arg.as_deref())?;
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let page = Arc::new(
            browser
                .new_page(CreateTargetParams::new("about:blank"))
                .await?,
        );
        self.configure_page(&page, &user_agent, spec.proxy.timezone.as_deref())
            .await?;

        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let fault = FaultSlot::default();
        let auth = spec.proxy.auth_responder().map(Arc::new);
        let interceptor = RequestInterceptor::new(
            Arc::clone(&page),
            Arc::clone(&spec.metrics),
            spec.log.clone(),
            events.clone(),
            fault.clone(),
            auth,
        );
        interceptor.enable().await?;

        spec.log.record(format!(
            "session launched (proxy: {}, timezone: {})",
            proxy_arg.as_deref().unwrap_or("none"),
            spec.proxy.timezone.as_deref().unwrap_or("none"),
        ));

        Ok(Box::new(SessionHandle {
            scraper: spec.scraper,
            browser: AsyncMutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
            driver: ChromiumPageDriver { page },
            interceptor,
            events,
            fault,
            log: spec.log,
            metrics: spec.metrics,
            shut_down: AtomicBool::new(false),
        }))
    }
}

/// Live chromium session for one attempt. Faults parked by the interceptor's
/// consumer tasks are re-raised at the next `goto`/`wait_for` boundary.
pub struct SessionHandle {
    scraper: String,
    browser: AsyncMutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    driver: ChromiumPageDriver,
    interceptor: RequestInterceptor,
    events: broadcast::Sender<SessionEvent>,
    fault: FaultSlot,
    log: AttemptLog,
    metrics: Arc<SessionMetrics>,
    shut_down: AtomicBool,
}

impl SessionHandle {
    fn raise_pending_fault(&self) -> SessionResult<()> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ScrapeSession for SessionHandle {
    async fn goto(&self, url: &str) -> SessionResult<()> {
        self.raise_pending_fault()?;
        self.log.record(format!("goto {url}"));
        self.driver.navigate(url).await?;
        let _ = self.events.send(SessionEvent::PageActivity);
        Ok(())
    }

    async fn wait_for(
        &self,
        outcomes: OutcomeSet,
        timeout: Duration,
    ) -> SessionResult<MatchedOutcome> {
        self.raise_pending_fault()?;
        let result = outcome::wait_for(
            self.events.subscribe(),
            &self.driver,
            &outcomes,
            timeout,
            &self.log,
        )
        .await;
        match &result {
            Ok(_) => self.metrics.record_outcome_match(),
            Err(SessionError::WaitTimeout { .. }) => self.metrics.record_wait_timeout(),
            Err(_) => {}
        }
        result
    }

    async fn content(&self) -> SessionResult<String> {
        self.driver.content().await
    }

    fn add_rule(&self, pattern: Regex, stage: InterceptStage, callback: Box<RuleCallback>) {
        self.interceptor.add(pattern, stage, callback);
    }

    fn log(&self, message: &str) {
        self.log.record(message);
    }

    async fn shutdown(&self) -> SessionResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.interceptor.disable().await;
        let browser = self.browser.lock().await.take();
        let closed_cleanly = match browser {
            Some(mut browser) => match browser.close().await {
                Ok(_) => true,
                Err(err) => {
                    warn!(scraper = %self.scraper, error = %err, "browser close failed");
                    false
                }
            },
            None => true,
        };
        let handler_task = self
            .handler_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(task) = handler_task {
            if closed_cleanly {
                if let Err(err) = task.await {
                    warn!(scraper = %self.scraper, error = %err, "handler join failed");
                }
            } else {
                // A wedged browser never ends the handler stream.
                task.abort();
            }
        }
        self.log.record("session shut down");
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            warn!(scraper = %self.scraper, "session dropped without explicit shutdown");
        }
    }
}

fn launch_args(
    config: &ScraperConfig,
    viewport: &ViewportSpec,
    user_agent: &str,
    proxy_arg: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        format!("--user-agent={user_agent}"),
        format!("--window-size={},{}", viewport.width, viewport.height),
    ];
    if config.flags.mute_audio {
        args.push("--mute-audio".into());
    }
    if let Some(lang) = &config.flags.lang {
        args.push(format!("--lang={lang}"));
    }
    if let Some(accept) = &config.flags.accept_language {
        args.push(format!("--accept-lang={accept}"));
    }
    if config.flags.disable_automation_controlled {
        args.push("--disable-blink-features=AutomationControlled".into());
    }
    if let Some(proxy) = proxy_arg {
        args.push(format!("--proxy-server={proxy}"));
    }
    args.push("--no-first-run".into());
    args.push("--password-store=basic".into());
    args.push("--disable-background-timer-throttling".into());
    args.extend(config.flags.extra_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use crate::config::{
        CacheBackend, CacheSection, ChromiumSection, FingerprintSection, FlagsSection,
        ObservabilitySection, ProxySection, RetrySection, UserAgentSection, ViewportSection,
    };

    use super::*;

    fn test_config() -> ScraperConfig {
        ScraperConfig {
            chromium: ChromiumSection {
                executable_path: None,
                headless: true,
                sandbox: false,
                request_timeout_seconds: 45,
            },
            flags: FlagsSection {
                disable_automation_controlled: true,
                mute_audio: true,
                lang: Some("en-US".to_string()),
                accept_language: Some("en-US,en;q=0.9".to_string()),
                extra_args: vec!["--disable-dev-shm-usage".to_string()],
            },
            user_agents: UserAgentSection {
                pool: vec!["UA-one".to_string(), "UA-two".to_string()],
            },
            viewport: ViewportSection {
                width: 1366,
                height: 768,
                jitter_pixels: 48,
            },
            fingerprint: FingerprintSection {
                enable_canvas_noise: false,
                enable_webgl_mask: false,
                enable_audio_mask: false,
                hide_webdriver: false,
                canvas_noise_range: [-2, 2],
                audio_noise: 0.0001,
                webgl_vendor: None,
                webgl_renderer: None,
            },
            proxy: ProxySection { enabled: true },
            retry: RetrySection {
                max_attempts: 3,
                delay_seconds: vec![1],
                jitter_seconds: 0,
                retryable_outcomes: None,
            },
            cache: CacheSection {
                enabled: false,
                backend: CacheBackend::Sqlite,
                db_path: "cache.db".to_string(),
                file_dir: "cache".to_string(),
                ttl_seconds: 0,
                busy_timeout_ms: 100,
                retry_attempts: 1,
                retry_base_delay_ms: 1,
                retry_jitter_ms: 0,
            },
            observability: ObservabilitySection {
                failure_log: "failures.jsonl".to_string(),
                trace_dir: None,
            },
        }
    }

    #[test]
    fn viewport_jitter_stays_within_the_configured_band() {
        let launcher = SessionLauncher::new(Arc::new(test_config()));
        for _ in 0..64 {
            let viewport = launcher.select_viewport();
            assert!(
                (1366 - 48..=1366 + 48).contains(&(viewport.width as i32)),
                "width out of band: {}",
                viewport.width
            );
            assert!((768 - 48..=768 + 48).contains(&(viewport.height as i32)));
        }
    }

    #[test]
    fn user_agent_comes_from_the_pool() {
        let launcher = SessionLauncher::new(Arc::new(test_config()));
        for _ in 0..16 {
            let ua = launcher.select_user_agent();
            assert!(ua == "UA-one" || ua == "UA-two");
        }
    }

    #[test]
    fn empty_pool_falls_back_to_the_stock_agent() {
        let mut config = test_config();
        config.user_agents.pool.clear();
        let launcher = SessionLauncher::new(Arc::new(config));
        assert_eq!(launcher.select_user_agent(), FALLBACK_USER_AGENT);
    }

    #[test]
    fn launch_args_carry_proxy_and_automation_flags() {
        let config = test_config();
        let viewport = ViewportSpec {
            width: 1400,
            height: 800,
        };
        let args = launch_args(&config, &viewport, "UA-one", Some("http://proxy.example:3128"));
        assert!(args.contains(&"--proxy-server=http://proxy.example:3128".to_string()));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(args.contains(&"--user-agent=UA-one".to_string()));
        assert!(args.contains(&"--window-size=1400,800".to_string()));
        assert!(args.contains(&"--disable-dev-shm-usage".to_string()));
    }

    #[test]
    fn launch_args_without_proxy_leave_the_flag_out() {
        let config = test_config();
        let viewport = ViewportSpec {
            width: 1366,
            height: 768,
        };
        let args = launch_args(&config, &viewport, "UA-two", None);
        assert!(!args.iter().any(|arg| arg.starts_with("--proxy-server=")));
    }
}
