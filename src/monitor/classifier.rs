//! Terminal state classification.
//!
//! A worker's captured pane is matched against an ordered table of rules.
//! The first rule whose pattern matches its slice of the snapshot decides the
//! worker's [`HealthState`] and, for stuck states, the keystrokes that should
//! unstick it. No match means `Unknown`, and nothing acts on `Unknown`.
//!
//! [`Classification`] values can only be produced here, so a worker's health
//! can only ever change through this module.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use crate::{flog_trace, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Active,
    Idle,
    StuckApproval,
    StuckEditing,
    WaitingExternal,
    Complete,
    Error,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Active => "active",
            HealthState::Idle => "idle",
            HealthState::StuckApproval => "stuck_approval",
            HealthState::StuckEditing => "stuck_editing",
            HealthState::WaitingExternal => "waiting_external",
            HealthState::Complete => "complete",
            HealthState::Error => "error",
        }
    }

    pub fn is_stuck(&self) -> bool {
        matches!(self, HealthState::StuckApproval | HealthState::StuckEditing)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keystrokes to send to a worker, as tmux key names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub keys: Vec<String>,
}

impl SuggestedAction {
    fn new(label: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            label: label.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Output of the classifier. Fields are read-only outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Classification {
    state: HealthState,
    action: Option<SuggestedAction>,
    rule: Option<String>,
}

impl Classification {
    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn action(&self) -> Option<&SuggestedAction> {
        self.action.as_ref()
    }

    /// Name of the rule that matched, if any.
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }
}

/// Which part of the snapshot a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The bottom `prompt_window_lines` lines.
    PromptWindow,
    /// Only the last non-blank line.
    LastLine,
    /// The whole captured tail.
    Snapshot,
    /// The question and option list of a prompt still open at the bottom of
    /// the pane. Rules with this scope are skipped when there is none.
    OpenPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTemplate {
    None,
    /// Pick the affirmative entry of an enumerated prompt, `y` for bare Y/n.
    AffirmativeOption,
    Keys(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub pattern: Regex,
    pub scope: Scope,
    pub state: HealthState,
    pub action: ActionTemplate,
}

impl Rule {
    pub fn new(
        name: &str,
        pattern: &str,
        scope: Scope,
        state: HealthState,
        action: ActionTemplate,
    ) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Validation(format!("rule '{}': {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            scope,
            state,
            action,
        })
    }
}

static OPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s│]*(?:[❯>›]\s*)?(\d{1,2})[.)]\s+(.+?)[\s│]*$").unwrap()
});

const AFFIRMATIVE_PREFIXES: &[&str] = &["yes", "allow", "approve", "accept", "proceed", "continue"];

/// One entry of an enumerated prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOption {
    pub number: u32,
    pub label: String,
}

/// Parse the most recent enumerated option list (`1. Yes` / `2) No` ...).
///
/// A new list starts at every option numbered 1, so older menus further up
/// the window are ignored.
pub fn parse_options(text: &str) -> Vec<PromptOption> {
    let mut options: Vec<PromptOption> = Vec::new();
    for line in text.lines() {
        let Some(caps) = OPTION_RE.captures(line) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u32>() else {
            continue;
        };
        let label = caps[2].to_string();
        if number == 1 {
            options.clear();
        }
        let expected = options.last().map(|o| o.number + 1).unwrap_or(1);
        if number == expected {
            options.push(PromptOption { number, label });
        }
    }
    options
}

/// Lines above option 1 that may hold the prompt's question.
const QUESTION_LINES: usize = 3;

/// Lines allowed below an open option list: box borders, key hints, `(Y/n)`.
static FOOTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\s│┃║╰╯╭╮─━═]*$|^[\s│]*(esc to (cancel|exit|go back)|enter to (confirm|select)|press enter|↑/↓|\(esc\))|[(\[]\s*y(?:es)?\s*/\s*n(?:o)?\s*[)\]][\s│]*$",
    )
    .unwrap()
});

/// Line range of the most recent enumerated list, first to last option.
fn latest_option_span(lines: &[&str]) -> Option<(usize, usize)> {
    let mut span = None;
    let mut next = 1;
    for (i, line) in lines.iter().enumerate() {
        let Some(number) = OPTION_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok())
        else {
            continue;
        };
        if number == 1 {
            span = Some((i, i));
            next = 2;
        } else if number == next {
            if let Some((first, _)) = span {
                span = Some((first, i));
                next += 1;
            }
        }
    }
    span
}

/// The open prompt at the bottom of `lines`, from a few lines above option 1
/// down. Any output after the list other than footer lines (agent activity,
/// a spinner, a new input box) means the list is not waiting for an answer.
fn open_prompt(lines: &[&str]) -> Option<String> {
    let (first, last) = latest_option_span(lines)?;
    if !lines[last + 1..].iter().all(|l| FOOTER_RE.is_match(l)) {
        return None;
    }
    let start = first.saturating_sub(QUESTION_LINES);
    Some(lines[start..].join("\n"))
}

/// The last option whose label reads as consent, e.g. "Yes, and don't ask again".
pub fn affirmative_option(options: &[PromptOption]) -> Option<&PromptOption> {
    options.iter().rev().find(|o| {
        let label = o.label.trim().to_lowercase();
        AFFIRMATIVE_PREFIXES.iter().any(|p| label.starts_with(p))
    })
}

pub struct Classifier {
    rules: Vec<Rule>,
    prompt_window_lines: usize,
    idle_threshold: Duration,
}

impl Classifier {
    /// Classifier with the built-in rule table.
    pub fn new(
        completion_markers: &[String],
        prompt_window_lines: usize,
        idle_threshold: Duration,
    ) -> Result<Self> {
        Ok(Self::with_rules(
            default_rules(completion_markers)?,
            prompt_window_lines,
            idle_threshold,
        ))
    }

    pub fn with_rules(rules: Vec<Rule>, prompt_window_lines: usize, idle_threshold: Duration) -> Self {
        Self {
            rules,
            prompt_window_lines: prompt_window_lines.max(1),
            idle_threshold,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify a snapshot. `idle_for` is the time since the worker last
    /// showed activity; it only turns `active` into `idle`.
    pub fn classify(&self, worker_id: &str, snapshot: &str, idle_for: Duration) -> Classification {
        let lines: Vec<&str> = snapshot.lines().collect();
        let end = lines
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .map(|i| i + 1)
            .unwrap_or(0);
        let content = &lines[..end];

        let window_start = end.saturating_sub(self.prompt_window_lines);
        let window = content[window_start..].join("\n");
        let prompt = open_prompt(&content[window_start..]);
        let last_line = content.last().copied().unwrap_or("");
        let whole = content.join("\n");

        for rule in &self.rules {
            let text = match rule.scope {
                Scope::PromptWindow => window.as_str(),
                Scope::LastLine => last_line,
                Scope::Snapshot => whole.as_str(),
                Scope::OpenPrompt => match prompt.as_deref() {
                    Some(p) => p,
                    None => continue,
                },
            };
            if !rule.pattern.is_match(text) {
                continue;
            }

            let mut state = rule.state;
            if state == HealthState::Active && idle_for >= self.idle_threshold {
                state = HealthState::Idle;
            }
            let action = if state.is_stuck() {
                resolve_action(&rule.action, text)
            } else {
                None
            };
            flog_trace!(
                "classify worker={} rule={} state={} action={:?}",
                worker_id,
                rule.name,
                state,
                action.as_ref().map(|a| &a.keys)
            );
            return Classification {
                state,
                action,
                rule: Some(rule.name.clone()),
            };
        }

        flog_trace!("classify worker={} no rule matched", worker_id);
        Classification::default()
    }

    /// Classification of a worker whose snapshot could not be taken.
    pub fn classify_unavailable(&self, worker_id: &str, reason: &str) -> Classification {
        flog_trace!("classify worker={} unavailable: {}", worker_id, reason);
        Classification {
            state: HealthState::Unknown,
            action: None,
            rule: Some("capture_failed".to_string()),
        }
    }
}

fn resolve_action(template: &ActionTemplate, text: &str) -> Option<SuggestedAction> {
    match template {
        ActionTemplate::None => None,
        ActionTemplate::Keys(keys) => Some(SuggestedAction {
            label: format!("send {}", keys.join(" ")),
            keys: keys.clone(),
        }),
        ActionTemplate::AffirmativeOption => {
            let options = parse_options(text);
            if options.is_empty() {
                if YES_NO_RE.is_match(text) {
                    return Some(SuggestedAction::new("answer yes", &["y", "Enter"]));
                }
                return None;
            }
            affirmative_option(&options).map(|o| SuggestedAction {
                label: format!("select option {} ({})", o.number, o.label.trim()),
                keys: vec![o.number.to_string(), "Enter".to_string()],
            })
        }
    }
}

static YES_NO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[(\[]\s*y(?:es)?\s*/\s*n(?:o)?\s*[)\]]|\by/n\s*[?:]?\s*$").unwrap()
});

/// Built-in rules, in evaluation order.
pub fn default_rules(completion_markers: &[String]) -> Result<Vec<Rule>> {
    use ActionTemplate as A;
    use HealthState as S;
    use Scope::*;

    let markers: Vec<String> = completion_markers
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(regex::escape)
        .collect();
    if markers.is_empty() {
        return Err(Error::Validation("no completion markers configured".to_string()));
    }
    let marker_pattern = format!(r"(?m)^.*(?:{}).*$", markers.join("|"));

    let affirm = || A::AffirmativeOption;
    let keys = |k: &[&str]| A::Keys(k.iter().map(|s| s.to_string()).collect());

    Ok(vec![
        Rule::new(
            "edit_confirmation",
            r"(?is)(do you want to (make this edit|create|overwrite|apply)|apply (this|these) (edit|change)s?\?|save (the )?changes\?).*\n[\s│]*(?:[❯>›]\s*)?1[.)]\s+\S",
            OpenPrompt,
            S::StuckEditing,
            affirm(),
        )?,
        Rule::new("vim_insert_mode", r"(?m)^-- (INSERT|REPLACE) --", PromptWindow, S::StuckEditing, keys(&["Escape", ":wq", "Enter"]))?,
        Rule::new("nano_editor", r"\^X Exit", PromptWindow, S::StuckEditing, keys(&["C-o", "Enter", "C-x"]))?,
        Rule::new(
            "approval_options",
            r"(?is)(do you want|would you like|allow|approve|permission|proceed|confirm|trust).*\n[\s│]*(?:[❯>›]\s*)?1[.)]\s+\S",
            OpenPrompt,
            S::StuckApproval,
            affirm(),
        )?,
        Rule::new(
            "approval_yes_no",
            r"(?i)[(\[]\s*y(?:es)?\s*/\s*n(?:o)?\s*[)\]]|\by/n\s*[?:]?\s*$",
            LastLine,
            S::StuckApproval,
            affirm(),
        )?,
        Rule::new("completion_marker", &marker_pattern, PromptWindow, S::Complete, A::None)?,
        Rule::new(
            "waiting_external",
            r"(?i)(rate limit|too many requests|quota exceeded|overloaded_error|usage limit|waiting for (ci|review|the build|checks)|retrying in \d+)",
            PromptWindow,
            S::WaitingExternal,
            A::None,
        )?,
        Rule::new(
            "error",
            r"(?im)(^\s*(error|fatal):|panicked at|traceback \(most recent call last\)|command not found|api error|authentication failed|segmentation fault)",
            PromptWindow,
            S::Error,
            A::None,
        )?,
        Rule::new(
            "agent_working",
            r"(?i)(esc to interrupt|ctrl\+c to interrupt|thinking…|thinking\.\.\.|running…|compiling |[✻✽✶✳✢]\s*\w+…)",
            PromptWindow,
            S::Active,
            A::None,
        )?,
        Rule::new("empty_input_prompt", r"^\s*(?:│\s*)?[>❯›]\s*(?:│\s*)?$", LastLine, S::Idle, A::None)?,
        Rule::new("shell_prompt", r"^\S*[$#]\s*$", LastLine, S::Idle, A::None)?,
        Rule::new("output", r"\S", Snapshot, S::Active, A::None)?,
    ])
}
