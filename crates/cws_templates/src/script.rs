//! Provisioning script generation.
//!
//! A script is a small fixed skeleton per package manager whose `{{block}}`
//! slots are filled by named render functions over a typed [`ScriptContext`].
//! Each section reports `STAGE:<name>:START` and `STAGE:<name>:COMPLETE`
//! through the `progress` shell function defined in the header, so launch
//! tooling can follow setup from the log or syslog.

use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::manifest::{ServiceConfig, Template, DEFAULT_SHELL};
use crate::package_manager::PackageManager;
use crate::renderer::TemplateRenderer;

/// Declared password value that requests a generated one.
pub const AUTO_GENERATED_PASSWORD: &str = "auto-generated";

/// Progress log; also receives the completion line when provisioning finishes.
pub const COMPLETION_MARKER: &str = "/var/log/cws-setup.log";

/// Prefix of every progress line written to the log and syslog.
pub const PROGRESS_PREFIX: &str = "[CWS-PROGRESS]";

pub const STAGE_START: &str = "START";
pub const STAGE_COMPLETE: &str = "COMPLETE";

const SETUP_COMPLETE_MESSAGE: &str = "All setup tasks finished successfully";

/// Preferred owner of per-user service state.
const SERVICE_USER: &str = "researcher";

const JUPYTER_PORT: u16 = 8888;
const RSTUDIO_PORT: u16 = 8787;
const SHINY_PORT: u16 = 3838;

const RSTUDIO_DEB_URL: &str =
    "https://download2.rstudio.org/server/jammy/amd64/rstudio-server-2024.12.0-467-amd64.deb";
const RSTUDIO_RPM_URL: &str = concat!(
    "https://download2.rstudio.org/server/rhel9/x86_64/",
    "rstudio-server-rhel-2024.12.0-467-x86_64.rpm"
);
const SHINY_DEB_URL: &str =
    "https://download3.rstudio.org/ubuntu-18.04/x86_64/shiny-server-1.5.22.1017-amd64.deb";
const SHINY_RPM_URL: &str =
    "https://download3.rstudio.org/centos7/x86_64/shiny-server-1.5.22.1017-x86_64.rpm";

/// Length of generated passwords.
pub const PASSWORD_LENGTH: usize = 16;

const FULL_SKELETON: &str = "#!/bin/bash
set -euo pipefail

{{header}}

{{bootstrap}}

{{packages}}

{{users}}

{{services}}

{{post_install}}

{{cleanup}}

{{completion}}
";

const IMAGE_SKELETON: &str = "#!/bin/bash
set -euo pipefail

{{header}}

{{users}}

{{services}}

{{post_install}}

{{completion}}
";

/// Random alphanumeric password from the OS entropy source.
pub fn generate_password(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// A user ready for the script, with its password decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUser {
    pub name: String,
    pub groups: Vec<String>,
    pub shell: String,
    pub password: String,
    pub generated_password: bool,
}

/// Everything the render functions need.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub template: &'a Template,
    pub manager: PackageManager,
    pub packages: &'a [String],
    pub users: Vec<PreparedUser>,
    pub services: &'a [ServiceConfig],
}

impl<'a> ScriptContext<'a> {
    pub fn new(template: &'a Template, manager: PackageManager) -> TemplateResult<Self> {
        let mut users = Vec::with_capacity(template.users.len());
        for user in &template.users {
            if !is_safe_identifier(&user.name) {
                return Err(TemplateError::ScriptGeneration(format!(
                    "invalid user name: {:?}",
                    user.name
                )));
            }
            let (password, generated) = match user.password.as_deref() {
                None | Some("") | Some(AUTO_GENERATED_PASSWORD) => {
                    (generate_password(PASSWORD_LENGTH), true)
                }
                Some(declared) => (declared.to_string(), false),
            };
            users.push(PreparedUser {
                name: user.name.clone(),
                groups: user.groups.clone(),
                shell: user
                    .shell
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
                password,
                generated_password: generated,
            });
        }

        if let Some(service) = template
            .services
            .iter()
            .find(|s| !is_safe_identifier(&s.name))
        {
            return Err(TemplateError::ScriptGeneration(format!(
                "invalid service name: {:?}",
                service.name
            )));
        }

        Ok(Self {
            template,
            manager,
            packages: manager.select_packages(&template.packages),
            users,
            services: &template.services,
        })
    }
}

pub fn render_header(ctx: &ScriptContext) -> String {
    format!(
        "# CloudWorkstation Template: {name}\n\
         # Package manager: {pm}\n\
         PROGRESS_LOG={log}\n\
         touch \"$PROGRESS_LOG\"\n\
         chmod 644 \"$PROGRESS_LOG\"\n\
         progress() {{\n\
         \x20   echo \"{prefix} $1\" | tee -a \"$PROGRESS_LOG\"\n\
         \x20   logger -t cws-setup \"{prefix} $1\" || true\n\
         }}\n\
         echo {banner}\n\
         echo \"Using package manager: {pm}\"\n\
         echo \"Started at: $(date)\"",
        name = ctx.template.name.replace('\n', " "),
        pm = ctx.manager,
        log = COMPLETION_MARKER,
        prefix = PROGRESS_PREFIX,
        banner = shell_quote(&format!("=== CloudWorkstation Setup: {} ===", ctx.template.name)),
    )
}

/// One progress marker line, e.g. `progress "STAGE:init:START"`.
pub fn render_progress(stage: &str, status: &str) -> String {
    format!("progress \"STAGE:{}:{}\"", stage, status)
}

/// Wrap a block in START/COMPLETE markers. Empty blocks still report.
fn staged(stage: &str, body: &str) -> String {
    let mut lines = vec![render_progress(stage, STAGE_START)];
    if !body.is_empty() {
        lines.push(body.to_string());
    }
    lines.push(render_progress(stage, STAGE_COMPLETE));
    lines.join("\n")
}

/// Progress stage name of the package installation block.
pub fn package_stage(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Conda => "conda-packages",
        PackageManager::Spack => "spack-packages",
        _ => "system-packages",
    }
}

pub fn render_bootstrap(ctx: &ScriptContext) -> String {
    let update = ctx.manager.system_update();
    let bootstrap = ctx.manager.bootstrap();
    if update.is_empty() && bootstrap.is_empty() {
        return String::new();
    }
    format!(
        "echo \"Updating system packages...\"\n{}\n{}",
        update, bootstrap
    )
}

pub fn render_packages(ctx: &ScriptContext) -> String {
    match ctx.manager.install_command(ctx.packages) {
        Some(install) => format!(
            "echo \"Installing template packages with {}...\"\n{}",
            ctx.manager, install
        ),
        None => String::new(),
    }
}

/// Pip packages, installed on top of the conda environment only.
pub fn render_pip_packages(ctx: &ScriptContext) -> String {
    if ctx.manager != PackageManager::Conda || ctx.template.packages.pip.is_empty() {
        return String::new();
    }
    format!(
        "echo \"Installing pip packages...\"\n/opt/miniforge/bin/pip install {}",
        ctx.template.packages.pip.join(" ")
    )
}

pub fn render_users(ctx: &ScriptContext) -> String {
    let mut blocks = Vec::new();
    for user in &ctx.users {
        let mut lines = vec![
            format!("# Create user: {}", user.name),
            format!("echo \"Creating user: {}\"", user.name),
            format!("useradd -m -s {} {} || true", shell_quote(&user.shell), user.name),
            format!(
                "echo {} | chpasswd",
                shell_quote(&format!("{}:{}", user.name, user.password))
            ),
        ];
        for group in &user.groups {
            lines.push(format!("usermod -aG {} {}", shell_quote(group), user.name));
        }
        let home = format!("/home/{}", user.name);
        match ctx.manager {
            PackageManager::Conda => {
                lines.push(format!(
                    "echo 'export PATH=\"/opt/miniforge/bin:$PATH\"' >> {}/.bashrc",
                    home
                ));
                lines.push(format!("chown -R {0}:{0} {1}", user.name, home));
            }
            PackageManager::Spack => {
                lines.push(format!("echo 'export SPACK_ROOT=/opt/spack' >> {}/.bashrc", home));
                lines.push(format!(
                    "echo '. /opt/spack/share/spack/setup-env.sh' >> {}/.bashrc",
                    home
                ));
                if !ctx.packages.is_empty() {
                    lines.push(format!("echo 'spack env activate default' >> {}/.bashrc", home));
                }
                lines.push(format!("chown -R {0}:{0} {1}", user.name, home));
            }
            _ => {}
        }
        blocks.push(lines.join("\n"));
    }
    blocks.join("\n\n")
}

/// Account that owns per-user service state: `researcher` when declared,
/// else the first user, else root.
fn service_owner(ctx: &ScriptContext) -> (String, String) {
    let user = ctx
        .users
        .iter()
        .find(|u| u.name == SERVICE_USER)
        .or_else(|| ctx.users.first());
    match user {
        Some(user) => (user.name.clone(), format!("/home/{}", user.name)),
        None => ("root".to_string(), "/root".to_string()),
    }
}

/// Install a vendor package: a `.deb` through gdebi or an `.rpm` through dnf.
fn vendor_install(
    manager: PackageManager,
    name: &str,
    deb_url: &str,
    rpm_url: &str,
) -> Vec<String> {
    match manager {
        PackageManager::Ami => Vec::new(),
        PackageManager::Dnf => vec![format!("dnf install -y {}", rpm_url)],
        _ => vec![
            format!("wget -q {} -O /tmp/{}.deb", deb_url, name),
            "apt-get install -y gdebi-core".to_string(),
            format!("gdebi -n /tmp/{}.deb", name),
            format!("rm -f /tmp/{}.deb", name),
        ],
    }
}

fn enable_lines(service: &ServiceConfig, verb: &str) -> Vec<String> {
    let mut lines = vec!["systemctl daemon-reload".to_string()];
    if service.is_enabled() {
        lines.push(format!("systemctl enable {} || true", service.name));
        lines.push(format!("systemctl {} {} || true", verb, service.name));
    }
    lines
}

fn render_jupyter(ctx: &ScriptContext, service: &ServiceConfig) -> Vec<String> {
    let (user, home) = service_owner(ctx);
    let port = service.exposed_port().unwrap_or(JUPYTER_PORT);
    let (binary, path) = match ctx.manager {
        PackageManager::Conda => (
            "/opt/miniforge/bin/jupyter",
            "/opt/miniforge/bin:/usr/local/bin:/usr/bin:/bin",
        ),
        _ => ("/usr/local/bin/jupyter", "/usr/local/bin:/usr/bin:/bin"),
    };
    let mut lines = vec![
        format!("mkdir -p {}/.jupyter", home),
        format!("JUPYTER_CONFIG={}/.jupyter/jupyter_lab_config.py", home),
        "echo \"c.ServerApp.token = ''\" >> \"$JUPYTER_CONFIG\"".to_string(),
        "echo \"c.ServerApp.password = ''\" >> \"$JUPYTER_CONFIG\"".to_string(),
        "echo \"c.ServerApp.disable_check_xsrf = False\" >> \"$JUPYTER_CONFIG\"".to_string(),
    ];
    for line in &service.config {
        lines.push(format!("echo {} >> \"$JUPYTER_CONFIG\"", shell_quote(line)));
    }
    lines.push(format!("chown -R {0}:{0} {1}/.jupyter", user, home));
    lines.push("cat > /etc/systemd/system/jupyter.service << 'UNITEOF'".to_string());
    lines.extend([
        "[Unit]".to_string(),
        "Description=Jupyter Lab Server".to_string(),
        "After=network.target".to_string(),
        String::new(),
        "[Service]".to_string(),
        "Type=simple".to_string(),
        format!("User={}", user),
        format!("WorkingDirectory={}", home),
        format!("Environment=PATH={}", path),
        format!("ExecStart={} lab --ip=127.0.0.1 --port={} --no-browser", binary, port),
        "Restart=always".to_string(),
        "RestartSec=10".to_string(),
        String::new(),
        "[Install]".to_string(),
        "WantedBy=multi-user.target".to_string(),
        "UNITEOF".to_string(),
    ]);
    lines.extend(enable_lines(service, "start"));
    lines
}

fn render_rstudio(ctx: &ScriptContext, service: &ServiceConfig) -> Vec<String> {
    let port = service.exposed_port().unwrap_or(RSTUDIO_PORT);
    let mut lines = vendor_install(ctx.manager, "rstudio-server", RSTUDIO_DEB_URL, RSTUDIO_RPM_URL);
    lines.push("mkdir -p /etc/rstudio".to_string());
    lines.push("cat > /etc/rstudio/rserver.conf << 'RSTUDIOEOF'".to_string());
    lines.push(format!("www-port={}", port));
    lines.push("www-address=127.0.0.1".to_string());
    if ctx.manager == PackageManager::Conda {
        lines.push("rsession-which-r=/opt/miniforge/bin/R".to_string());
        lines.push("rsession-ld-library-path=/opt/miniforge/lib".to_string());
    }
    lines.push("RSTUDIOEOF".to_string());
    for line in &service.config {
        lines.push(format!("echo {} >> /etc/rstudio/rserver.conf", shell_quote(line)));
    }
    lines.push("cat > /etc/rstudio/rsession.conf << 'RSTUDIOEOF'".to_string());
    lines.push("session-timeout-minutes=0".to_string());
    lines.push("r-libs-user=~/R/library".to_string());
    lines.push("RSTUDIOEOF".to_string());
    lines.push("groupadd -f rstudio-users".to_string());
    for user in &ctx.users {
        lines.push(format!("usermod -aG rstudio-users {}", user.name));
    }
    lines.extend(enable_lines(service, "restart"));
    lines
}

fn render_shiny(ctx: &ScriptContext, service: &ServiceConfig) -> Vec<String> {
    let port = service.exposed_port().unwrap_or(SHINY_PORT);
    let mut lines = vendor_install(ctx.manager, "shiny-server", SHINY_DEB_URL, SHINY_RPM_URL);
    if ctx.manager != PackageManager::Ami {
        let r = match ctx.manager {
            PackageManager::Conda => "/opt/miniforge/bin/R",
            _ => "R",
        };
        lines.push(format!(
            "{} -e \"install.packages('shiny', repos='https://cloud.r-project.org')\" || true",
            r
        ));
    }
    lines.push("mkdir -p /etc/shiny-server".to_string());
    lines.push("cat > /etc/shiny-server/shiny-server.conf << 'SHINYEOF'".to_string());
    lines.extend([
        "run_as shiny;".to_string(),
        "server {".to_string(),
        format!("  listen {} 127.0.0.1;", port),
        "  location / {".to_string(),
        "    site_dir /srv/shiny-server;".to_string(),
        "    log_dir /var/log/shiny-server;".to_string(),
        "    directory_index on;".to_string(),
        "  }".to_string(),
        "}".to_string(),
        "SHINYEOF".to_string(),
    ]);
    for line in &service.config {
        lines.push(format!(
            "echo {} >> /etc/shiny-server/shiny-server.conf",
            shell_quote(line)
        ));
    }
    let (owner, _) = service_owner(ctx);
    lines.push("mkdir -p /srv/shiny-server".to_string());
    lines.push("chmod 755 /srv/shiny-server".to_string());
    lines.push(format!("chown -R {}:shiny /srv/shiny-server || true", owner));
    lines.extend(enable_lines(service, "restart"));
    lines
}

/// Generic service: config lines into `/etc/<name>/<name>.conf`.
fn render_generic_service(service: &ServiceConfig) -> Vec<String> {
    let mut lines = Vec::new();
    if !service.config.is_empty() {
        lines.push(format!("mkdir -p /etc/{}", service.name));
        for line in &service.config {
            lines.push(format!(
                "echo {} >> /etc/{1}/{1}.conf",
                shell_quote(line),
                service.name
            ));
        }
    }
    if service.is_enabled() {
        lines.push(format!("systemctl enable {} || true", service.name));
        lines.push(format!("systemctl start {} || true", service.name));
    }
    lines
}

pub fn render_services(ctx: &ScriptContext) -> String {
    let mut blocks = Vec::new();
    for service in ctx.services {
        let mut lines = vec![
            format!("# Configure service: {}", service.name),
            format!("echo \"Configuring service: {}\"", service.name),
        ];
        lines.extend(match service.name.as_str() {
            "jupyter" => render_jupyter(ctx, service),
            "rstudio-server" => render_rstudio(ctx, service),
            "shiny-server" => render_shiny(ctx, service),
            _ => render_generic_service(service),
        });
        blocks.push(lines.join("\n"));
    }
    blocks.join("\n\n")
}

pub fn render_post_install(ctx: &ScriptContext) -> String {
    let script = ctx.template.post_install.trim_end();
    if script.is_empty() {
        return String::new();
    }
    format!(
        "# Post-install script\necho \"Running post-install script...\"\n{}",
        script
    )
}

pub fn render_cleanup(ctx: &ScriptContext) -> String {
    let cleanup = ctx.manager.cleanup();
    if cleanup.is_empty() {
        return String::new();
    }
    format!("echo \"Cleaning up...\"\n{}", cleanup)
}

pub fn render_completion(ctx: &ScriptContext) -> String {
    let mut lines = vec![
        "echo \"=== Setup Complete ===\"".to_string(),
        format!("echo {}", shell_quote(&format!("Template: {}", ctx.template.name))),
    ];
    for user in &ctx.users {
        lines.push(format!("echo \"User created: {}\"", user.name));
    }
    for service in ctx.services {
        if let Some(port) = service.exposed_port() {
            lines.push(format!(
                "echo \"Service available: {} on port {}\"",
                service.name, port
            ));
        }
    }
    lines.push(format!("progress \"SETUP:COMPLETE:{}\"", SETUP_COMPLETE_MESSAGE));
    lines.push(format!(
        "echo \"CloudWorkstation setup completed at $(date)\" >> {}",
        COMPLETION_MARKER
    ));
    lines.join("\n")
}

/// Collapse runs of blank lines left by empty blocks.
fn tidy(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    let mut blank_run = 0;
    for line in script.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Renders provisioning scripts.
#[derive(Debug, Clone)]
pub struct ScriptGenerator {
    renderer: TemplateRenderer,
}

impl Default for ScriptGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptGenerator {
    pub fn new() -> Self {
        Self {
            renderer: TemplateRenderer::strict(),
        }
    }

    fn skeleton(manager: PackageManager) -> &'static str {
        match manager {
            PackageManager::Ami => IMAGE_SKELETON,
            _ => FULL_SKELETON,
        }
    }

    /// Generate the script for a template under a package manager.
    pub fn generate(&self, template: &Template, manager: PackageManager) -> TemplateResult<String> {
        let ctx = ScriptContext::new(template, manager)?;
        self.render(&ctx)
    }

    pub fn render(&self, ctx: &ScriptContext) -> TemplateResult<String> {
        let mut packages = staged(package_stage(ctx.manager), &render_packages(ctx));
        if ctx.manager == PackageManager::Conda {
            packages.push_str("\n\n");
            packages.push_str(&staged("pip-packages", &render_pip_packages(ctx)));
        }

        let mut blocks = BTreeMap::new();
        blocks.insert("header".to_string(), render_header(ctx));
        blocks.insert("bootstrap".to_string(), staged("init", &render_bootstrap(ctx)));
        blocks.insert("packages".to_string(), packages);
        blocks.insert("users".to_string(), staged("user-setup", &render_users(ctx)));
        blocks.insert(
            "services".to_string(),
            staged("service-config", &render_services(ctx)),
        );
        blocks.insert(
            "post_install".to_string(),
            staged("post-install", &render_post_install(ctx)),
        );
        blocks.insert("cleanup".to_string(), staged("ready", &render_cleanup(ctx)));
        blocks.insert("completion".to_string(), render_completion(ctx));

        let script = self
            .renderer
            .render_content(Self::skeleton(ctx.manager), &blocks)
            .map_err(|e| TemplateError::ScriptGeneration(e.to_string()))?;
        debug!(
            "Generated {} byte {} script for {}",
            script.len(),
            ctx.manager,
            ctx.template.name
        );
        Ok(tidy(&script))
    }
}
