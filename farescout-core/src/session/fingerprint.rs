use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;

use crate::config::FingerprintSection;

use super::error::{SessionError, SessionResult};

const DEFAULT_WEBGL_VENDOR: &str = "Intel Inc.";
const DEFAULT_WEBGL_RENDERER: &str = "Intel Iris OpenGL Engine";

/// Document-start scripts that blur the traits anti-bot vendors probe:
/// canvas readback, WebGL strings, audio buffers, `navigator.webdriver`.
/// Applied once per session before the first navigation.
#[derive(Debug, Clone)]
pub struct FingerprintMasker {
    config: FingerprintSection,
}

impl FingerprintMasker {
    pub fn new(config: FingerprintSection) -> Self {
        Self { config }
    }

    /// Scripts selected by the config toggles, in injection order.
    pub fn scripts(&self) -> Vec<String> {
        let mut scripts = Vec::new();
        if self.config.hide_webdriver {
            scripts.push(webdriver_script());
        }
        if self.config.enable_canvas_noise {
            scripts.push(self.canvas_script());
        }
        if self.config.enable_webgl_mask {
            scripts.push(self.webgl_script());
        }
        if self.config.enable_audio_mask {
            scripts.push(self.audio_script());
        }
        scripts
    }

    pub async fn apply(&self, page: &Page) -> SessionResult<()> {
        for source in self.scripts() {
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(source)
                    .build()
                    .map_err(SessionError::Configuration)?,
            )
            .await?;
        }
        Ok(())
    }

    fn canvas_script(&self) -> String {
        let [min, max] = self.config.canvas_noise_range;
        format!(
            r#"
            (() => {{
                const jitter = (min, max) => Math.floor(Math.random() * (max - min + 1)) + min;
                const original = HTMLCanvasElement.prototype.toDataURL;
                HTMLCanvasElement.prototype.toDataURL = function () {{
                    try {{
                        const ctx = this.getContext('2d');
                        if (ctx && this.width > 0 && this.height > 0) {{
                            const pixels = ctx.getImageData(0, 0, this.width, this.height);
                            for (let i = 0; i < pixels.data.length; i += 16) {{
                                pixels.data[i] = Math.min(255, Math.max(0, pixels.data[i] + jitter({min}, {max})));
                            }}
                            ctx.putImageData(pixels, 0, 0);
                        }}
                    }} catch (_) {{}}
                    return original.apply(this, arguments);
                }};
            }})();
            "#
        )
    }

    fn webgl_script(&self) -> String {
        let vendor = self
            .config
            .webgl_vendor
            .as_deref()
            .unwrap_or(DEFAULT_WEBGL_VENDOR);
        let renderer = self
            .config
            .webgl_renderer
            .as_deref()
            .unwrap_or(DEFAULT_WEBGL_RENDERER);
        format!(
            r#"
            (() => {{
                const patch = (proto) => {{
                    if (!proto || !proto.getParameter) {{
                        return;
                    }}
                    const original = proto.getParameter;
                    proto.getParameter = function (name) {{
                        if (name === 37445) {{
                            return '{vendor}';
                        }}
                        if (name === 37446) {{
                            return '{renderer}';
                        }}
                        return original.apply(this, arguments);
                    }};
                }};
                if (typeof WebGLRenderingContext !== 'undefined') {{
                    patch(WebGLRenderingContext.prototype);
                }}
                if (typeof WebGL2RenderingContext !== 'undefined') {{
                    patch(WebGL2RenderingContext.prototype);
                }}
            }})();
            "#
        )
    }

    fn audio_script(&self) -> String {
        let level = self.config.audio_noise;
        format!(
            r#"
            (() => {{
                if (typeof AudioBuffer === 'undefined' || !AudioBuffer.prototype.getChannelData) {{
                    return;
                }}
                const original = AudioBuffer.prototype.getChannelData;
                AudioBuffer.prototype.getChannelData = function (channel) {{
                    const data = original.call(this, channel);
                    for (let i = 0; i < data.length; i += 100) {{
                        data[i] += Math.random() * {level} - {level} / 2;
                    }}
                    return data;
                }};
            }})();
            "#
        )
    }
}

fn webdriver_script() -> String {
    r#"
    (() => {
        Object.defineProperty(Object.getPrototypeOf(navigator), 'webdriver', {
            get: () => undefined,
            configurable: true,
        });
        if (!window.chrome) {
            window.chrome = { runtime: {} };
        }
    })();
    "#
    .to_string()
}
