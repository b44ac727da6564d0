//! Agent launch profiles and command assembly.
//!
//! Each [`AgentKind`] maps to a static profile describing how to start the
//! agent binary: base arguments, the optional session-resume argument, the
//! optional persona-prompt flag, and whether the agent accepts pasted
//! images. [`LaunchPlan::build`] turns a profile plus session parameters
//! into the concrete program, argv, and environment for the PTY spawn.

use protocol::{AgentKind, SessionParams};

/// Characters that disqualify a persona prompt from command-line injection.
const DANGEROUS_PROMPT_CHARS: &[char] = &['`', '$', '|', ';', '&', '>', '<', '\0'];

/// Static launch description for one agent kind.
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    /// Which agent this profile describes.
    pub kind: AgentKind,
    /// Display name for listings.
    pub display_name: &'static str,
    /// One-line description for listings.
    pub description: &'static str,
    /// Executable name; empty for the shell kind (resolved at plan time).
    pub program: &'static str,
    /// Arguments always passed to the executable.
    pub base_args: &'static [&'static str],
    /// Flag that resumes a named session, when the agent supports one.
    pub session_arg: Option<&'static str>,
    /// Flag that injects a persona system prompt, when supported.
    pub persona_flag: Option<&'static str>,
    /// Input command template referencing a persisted artifact.
    pub artifact_command: Option<&'static str>,
    /// Whether pasted images are accepted for this agent.
    pub supports_images: bool,
}

static PROFILES: [AgentProfile; 5] = [
    AgentProfile {
        kind: AgentKind::Claude,
        display_name: "Claude",
        description: "Anthropic Claude Code CLI",
        program: "claude",
        base_args: &["--dangerously-skip-permissions"],
        session_arg: Some("--session-id"),
        persona_flag: Some("--append-system-prompt"),
        artifact_command: Some("add"),
        supports_images: true,
    },
    AgentProfile {
        kind: AgentKind::Gemini,
        display_name: "Gemini",
        description: "Google Gemini CLI",
        program: "gemini",
        base_args: &["--yolo"],
        session_arg: None,
        persona_flag: None,
        artifact_command: Some("add"),
        supports_images: true,
    },
    AgentProfile {
        kind: AgentKind::Codex,
        display_name: "Codex",
        description: "OpenAI Codex CLI",
        program: "codex",
        base_args: &[],
        session_arg: None,
        persona_flag: None,
        artifact_command: None,
        supports_images: false,
    },
    AgentProfile {
        kind: AgentKind::Opencode,
        display_name: "OpenCode",
        description: "OpenCode CLI",
        program: "opencode",
        base_args: &[],
        session_arg: None,
        persona_flag: None,
        artifact_command: None,
        supports_images: false,
    },
    AgentProfile {
        kind: AgentKind::Shell,
        display_name: "Shell",
        description: "System shell",
        program: "",
        base_args: &[],
        session_arg: None,
        persona_flag: None,
        artifact_command: None,
        supports_images: false,
    },
];

impl AgentProfile {
    /// Looks up the static profile for an agent kind.
    pub fn for_kind(kind: AgentKind) -> &'static AgentProfile {
        // PROFILES covers every variant; the linear scan is over five entries.
        PROFILES
            .iter()
            .find(|p| p.kind == kind)
            .unwrap_or(&PROFILES[0])
    }

    /// All profiles, in listing order.
    pub fn all() -> &'static [AgentProfile] {
        &PROFILES
    }

    /// The executable this profile launches, resolving the shell kind.
    pub fn resolve_program(&self, default_shell: Option<&str>) -> String {
        if self.kind == AgentKind::Shell {
            detect_shell(default_shell)
        } else {
            self.program.to_string()
        }
    }

    /// Whether the executable can be found on this host.
    pub fn is_available(&self, default_shell: Option<&str>) -> bool {
        which::which(self.resolve_program(default_shell)).is_ok()
    }
}

/// Concrete spawn recipe produced from a profile and session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    /// Assembles the launch plan for a session.
    ///
    /// The session-resume argument is added only when the session id is a
    /// well-formed UUID v4 (the agent CLI rejects anything else). Persona
    /// prompts are injected only for agents with a persona flag, and only
    /// when the prompt survives sanitization.
    pub fn build(params: &SessionParams, default_shell: Option<&str>) -> Self {
        let profile = AgentProfile::for_kind(params.agent);
        let program = profile.resolve_program(default_shell);
        let mut args: Vec<String> = profile.base_args.iter().map(|a| a.to_string()).collect();

        if let Some(flag) = profile.session_arg {
            if params.has_valid_session_uuid() {
                args.push(flag.to_string());
                args.push(params.session_id.clone());
            } else {
                tracing::warn!(
                    session_id = %params.session_id,
                    "session id is not a UUID v4, skipping session argument"
                );
            }
        }

        if let Some(flag) = profile.persona_flag {
            if let Some(prompt) = persona_prompt(&params.role) {
                match sanitize_prompt(prompt) {
                    Some(escaped) => {
                        args.push(flag.to_string());
                        args.push(escaped);
                    }
                    None => {
                        tracing::warn!(
                            role = %params.role,
                            "persona prompt contains dangerous characters, skipping injection"
                        );
                    }
                }
            }
        }

        Self {
            program,
            args,
            env: terminal_env(),
        }
    }
}

/// Environment overrides so the child reports full terminal capabilities.
fn terminal_env() -> Vec<(String, String)> {
    let mut env = vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ];
    let lang_unset = std::env::var("LANG").map(|v| v.is_empty()).unwrap_or(true);
    if lang_unset {
        env.push(("LANG".to_string(), "en_US.UTF-8".to_string()));
    }
    env
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The configured default shell if set
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(configured: Option<&str>) -> String {
    if let Some(s) = configured {
        if !s.is_empty() {
            return s.to_string();
        }
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// The fixed system prompt for a role, when one is defined.
pub fn persona_prompt(role: &str) -> Option<&'static str> {
    match role {
        "PM" => Some(
            "You are an expert Technical Project Manager.\n\
             Your Goal: Break down vague requirements into clear, actionable technical tasks.\n\
             Rules:\n\
             1. Do NOT write code implementation details.\n\
             2. Focus on architecture, file structure, and step-by-step planning.\n\
             3. Delegate implementation tasks to Developers.",
        ),
        "Dev" => Some(
            "You are a Senior Full-Stack Developer.\n\
             Your Goal: Write clean, production-ready code based on instructions.\n\
             Rules:\n\
             1. Focus on implementation. Write filenames and code blocks clearly.\n\
             2. If specifications are missing, ask the PM.\n\
             3. Keep explanations concise. Code is your language.",
        ),
        "QA" => Some(
            "You are a QA Lead and Security Specialist.\n\
             Your Goal: Find bugs, security flaws, and logic errors.\n\
             Rules:\n\
             1. Review code critically.\n\
             2. Suggest test cases.\n\
             3. Verify if the code meets requirements.",
        ),
        _ => None,
    }
}

/// Escapes a persona prompt for single-argument injection.
///
/// Returns `None` when the prompt contains characters that could escape the
/// argument boundary on a hostile shell. Quotes are backslash-escaped and
/// newlines flattened to spaces so the prompt stays one argument.
fn sanitize_prompt(prompt: &str) -> Option<String> {
    if prompt.contains(DANGEROUS_PROMPT_CHARS) {
        return None;
    }
    Some(prompt.replace('"', "\\\"").replace(['\n', '\r'], " "))
}
