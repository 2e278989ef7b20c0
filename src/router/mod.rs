//! Pure intent classification. `parse` never touches the database or the
//! network; everything downstream of it (resolution, enqueue, replies)
//! operates on the `ParsedMessage` it returns.

use once_cell::sync::Lazy;
use regex::Regex;

/// The router's output: what kind of thing the user asked for, plus
/// whatever typed arguments that kind carries. Modeled as a sum type
/// rather than a string tag + untyped map, since Rust has no convenient
/// heterogeneous map and a match arm per variant is more useful anyway.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Help,
    Status,
    History,
    Clear,
    Tasks,
    Cancel { id_prefix: String },
    Trace { task_id: Option<String> },
    SetMode { assistant: bool },
    StatusInquiry,
    ReviewPr { repo_hint: Option<String>, pr_number: u64 },
    FixIssue { repo_hint: Option<String>, issue_number: u64 },
    Simplify { repo_hint: Option<String>, path: String },
    Validate { repo_hint: Option<String> },
    CreateProject { name: String, template: Option<String> },
    ListSchedules,
    RemoveSchedule { id: i64 },
    ScheduleCreate { text: String, repo_hint: Option<String> },
    Discuss { topic: String },
    InitRepo { name: String, git_url: String, branch: Option<String> },
    FreeForm { repo_hint: Option<String> },
}

/// `parse`'s full output: the classified message, the priority extracted
/// from it (marker stripped), and the text the marker was stripped from.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub message: ParsedMessage,
    pub priority: i64,
    pub raw_text: String,
}

static PRIORITY_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)--priority\s+(urgent|high|normal|low)").unwrap());
static PRIORITY_LEADING_URGENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*urgent:\s*").unwrap());
static PRIORITY_IMPORTANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)!important").unwrap());
static PRIORITY_PCODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bp([0-3])\b").unwrap());

static CANCEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^cancel\s+(\S+)$").unwrap());
static TRACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^trace(?:\s+(\S+))?$").unwrap());
static MODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(mode\s+(assistant|strict)|assistant mode|back to normal)$").unwrap());
static STATUS_INQUIRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(done\??|any updates?\??|eta\??|how'?s it going\??|progress\??)$").unwrap()
});
static REVIEW_PR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)review\s+pr\s+#?(\d+)\s+(?:on|in)\s+(\S+)").unwrap());
static FIX_ISSUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)fix\s+issue\s+#?(\d+)\s+(?:on|in)\s+(\S+)").unwrap());
static SIMPLIFY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)simplify\s+(\S+)\s+(?:on|in)\s+(\S+)").unwrap());
static VALIDATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^validate\s+(\S+)$").unwrap());
static CREATE_PROJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:create|new)\s+project\s+(\S+)(?:\s+with\s+template\s+(\S+))?").unwrap()
});
static LIST_SCHEDULES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(list schedules|show my schedules|what'?s scheduled)\??$").unwrap());
static REMOVE_SCHEDULE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:remove|delete|cancel)\s+schedule\s+#?(\d+)$").unwrap());
static SCHEDULE_CREATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(every|each|daily|weekly|monthly|at\s+\d{1,2}(:\d{2})?\s*.*\b(every|each|daily|weekly))\b").unwrap()
});
static DISCUSS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(discuss|brainstorm)\s+(.+)$|(?i)^I have an? (?:new )?idea\b").unwrap()
});
static INIT_REPO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:init|setup|add)\s+repo\s+(\S+)\s+(\S+)(?:\s+(\S+))?").unwrap()
});
static CLONE_OWNER_REPO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:clone|setup|add|use)\s+([\w.-]+/[\w.-]+)").unwrap());
static GITHUB_URL_SETUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:set ?up|add|init|clone|track).{0,40}github\.com/([\w.-]+)/([\w.-]+)").unwrap()
});
static TRAILING_HINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:on|in)\s+(\S+)\s*$").unwrap());

fn extract_priority(text: &str) -> (String, i64) {
    if let Some(caps) = PRIORITY_FLAG.captures(text) {
        let level = caps.get(1).unwrap().as_str().to_lowercase();
        let priority = match level.as_str() {
            "urgent" => 2,
            "high" => 1,
            _ => 0,
        };
        let stripped = PRIORITY_FLAG.replace(text, "").trim().to_string();
        return (stripped, priority);
    }
    if PRIORITY_LEADING_URGENT.is_match(text) {
        let stripped = PRIORITY_LEADING_URGENT.replace(text, "").trim().to_string();
        return (stripped, 2);
    }
    if PRIORITY_IMPORTANT.is_match(text) {
        let stripped = PRIORITY_IMPORTANT.replace(text, "").trim().to_string();
        return (stripped, 1);
    }
    if let Some(caps) = PRIORITY_PCODE.captures(text) {
        let digit: i64 = caps.get(1).unwrap().as_str().parse().unwrap_or(3);
        let priority = match digit {
            0 => 2,
            1 => 1,
            _ => 0,
        };
        let stripped = PRIORITY_PCODE.replace(text, "").trim().to_string();
        return (stripped, priority);
    }
    (text.to_string(), 0)
}

fn trailing_repo_hint(text: &str) -> Option<String> {
    TRAILING_HINT_RE
        .captures(text)
        .map(|c| c.get(1).unwrap().as_str().to_string())
}

/// Classify a raw inbound message. Pure: no I/O, no randomness.
pub fn parse(text: &str) -> Parsed {
    let (stripped, priority) = extract_priority(text);
    let normalized = stripped.trim();
    let lower = normalized.to_lowercase();

    let message = classify(normalized, &lower);

    Parsed {
        message,
        priority,
        raw_text: stripped,
    }
}

fn classify(text: &str, lower: &str) -> ParsedMessage {
    // 1. literal/slash-prefixed meta
    let bare = lower.trim_start_matches('/');
    match bare {
        "help" => return ParsedMessage::Help,
        "status" => return ParsedMessage::Status,
        "history" | "my tasks" => return ParsedMessage::History,
        "clear" | "reset" => return ParsedMessage::Clear,
        "tasks" => return ParsedMessage::Tasks,
        _ => {}
    }
    if let Some(caps) = CANCEL_RE.captures(text) {
        return ParsedMessage::Cancel {
            id_prefix: caps.get(1).unwrap().as_str().to_string(),
        };
    }
    if bare == "trace" || TRACE_RE.is_match(text) {
        if let Some(caps) = TRACE_RE.captures(text) {
            return ParsedMessage::Trace {
                task_id: caps.get(1).map(|m| m.as_str().to_string()),
            };
        }
    }

    // 2. mode
    if let Some(caps) = MODE_RE.captures(lower) {
        let assistant = caps.get(0).unwrap().as_str().contains("assistant");
        return ParsedMessage::SetMode { assistant };
    }

    // 3. natural short status inquiries
    if text.len() < 60 && STATUS_INQUIRY_RE.is_match(text) {
        return ParsedMessage::StatusInquiry;
    }

    // 4. typed task intents
    if let Some(caps) = REVIEW_PR_RE.captures(text) {
        return ParsedMessage::ReviewPr {
            pr_number: caps.get(1).unwrap().as_str().parse().unwrap_or(0),
            repo_hint: Some(caps.get(2).unwrap().as_str().to_string()),
        };
    }
    if let Some(caps) = FIX_ISSUE_RE.captures(text) {
        return ParsedMessage::FixIssue {
            issue_number: caps.get(1).unwrap().as_str().parse().unwrap_or(0),
            repo_hint: Some(caps.get(2).unwrap().as_str().to_string()),
        };
    }
    if let Some(caps) = SIMPLIFY_RE.captures(text) {
        return ParsedMessage::Simplify {
            path: caps.get(1).unwrap().as_str().to_string(),
            repo_hint: Some(caps.get(2).unwrap().as_str().to_string()),
        };
    }
    if let Some(caps) = VALIDATE_RE.captures(text) {
        return ParsedMessage::Validate {
            repo_hint: Some(caps.get(1).unwrap().as_str().to_string()),
        };
    }
    if let Some(caps) = CREATE_PROJECT_RE.captures(text) {
        return ParsedMessage::CreateProject {
            name: caps.get(1).unwrap().as_str().to_string(),
            template: caps.get(2).map(|m| m.as_str().to_string()),
        };
    }

    // 5. schedule management
    if LIST_SCHEDULES_RE.is_match(text) {
        return ParsedMessage::ListSchedules;
    }
    if let Some(caps) = REMOVE_SCHEDULE_RE.captures(text) {
        return ParsedMessage::RemoveSchedule {
            id: caps.get(1).unwrap().as_str().parse().unwrap_or(0),
        };
    }

    // 6. schedule creation
    if SCHEDULE_CREATE_RE.is_match(text) {
        return ParsedMessage::ScheduleCreate {
            text: text.to_string(),
            repo_hint: trailing_repo_hint(text),
        };
    }

    // 7. discuss
    if let Some(caps) = DISCUSS_RE.captures(text) {
        let topic = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| text.to_string());
        return ParsedMessage::Discuss { topic };
    }

    // 8. repo onboarding
    if let Some(caps) = INIT_REPO_RE.captures(text) {
        return ParsedMessage::InitRepo {
            name: caps.get(1).unwrap().as_str().to_string(),
            git_url: caps.get(2).unwrap().as_str().to_string(),
            branch: caps.get(3).map(|m| m.as_str().to_string()),
        };
    }
    if let Some(caps) = CLONE_OWNER_REPO_RE.captures(text) {
        let owner_repo = caps.get(1).unwrap().as_str();
        let name = owner_repo.rsplit('/').next().unwrap_or(owner_repo).to_string();
        return ParsedMessage::InitRepo {
            name,
            git_url: format!("https://github.com/{owner_repo}.git"),
            branch: None,
        };
    }
    if let Some(caps) = GITHUB_URL_SETUP_RE.captures(text) {
        let owner = caps.get(1).unwrap().as_str();
        let name = caps.get(2).unwrap().as_str();
        return ParsedMessage::InitRepo {
            name: name.to_string(),
            git_url: format!("https://github.com/{owner}/{name}.git"),
            branch: None,
        };
    }

    // 9. fallback
    ParsedMessage::FreeForm {
        repo_hint: trailing_repo_hint(text),
    }
}

/// Compose the prompt handed to the runner for a resolved task.
pub fn build_prompt(kind_instruction: &str, history_digest: Option<&str>, current_request: &str) -> String {
    let persona = "You are an autonomous coding agent operating without a human in the loop for this turn.";
    let pipeline_hint = "Do not invoke interactive CLI tools that require a terminal (pagers, editors, prompts); this runs in a non-interactive chat pipeline.";

    let mut parts = vec![persona.to_string(), pipeline_hint.to_string()];
    if let Some(digest) = history_digest {
        parts.push(format!("Previous conversation: {digest}"));
    }
    parts.push(format!("Current request:\n{current_request}"));
    parts.push(kind_instruction.to_string());
    parts.join("\n\n")
}

pub fn build_cron_prompt(kind_instruction: &str, current_request: &str) -> String {
    let preamble = "Do not ask clarifying questions; proceed autonomously to completion.";
    format!("{preamble}\n\n{}", build_prompt(kind_instruction, None, current_request))
}

pub fn build_discuss_prompt(history_digest: Option<&str>, current_request: &str) -> String {
    let instruction = "This is a discussion only: do not modify any files or run commands that change repository state.";
    build_prompt(instruction, history_digest, current_request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_flag_stripped_and_mapped() {
        let parsed = parse("fix the bug --priority urgent");
        assert_eq!(parsed.priority, 2);
        assert_eq!(parsed.raw_text, "fix the bug");
    }

    #[test]
    fn leading_urgent_marker() {
        let parsed = parse("urgent: drop everything");
        assert_eq!(parsed.priority, 2);
        assert_eq!(parsed.raw_text, "drop everything");
    }

    #[test]
    fn pcode_marker() {
        let parsed = parse("p1 check the deploy");
        assert_eq!(parsed.priority, 1);
        assert!(!parsed.raw_text.to_lowercase().contains("p1"));
    }

    #[test]
    fn review_pr_intent() {
        let parsed = parse("review PR #42 on my-app");
        assert_eq!(
            parsed.message,
            ParsedMessage::ReviewPr {
                repo_hint: Some("my-app".to_string()),
                pr_number: 42,
            }
        );
    }

    #[test]
    fn meta_commands() {
        assert_eq!(parse("help").message, ParsedMessage::Help);
        assert_eq!(parse("/status").message, ParsedMessage::Status);
        assert_eq!(parse("clear").message, ParsedMessage::Clear);
    }

    #[test]
    fn free_form_with_trailing_hint() {
        let parsed = parse("please look at the flaky test on my-app");
        assert_eq!(
            parsed.message,
            ParsedMessage::FreeForm {
                repo_hint: Some("my-app".to_string()),
            }
        );
    }

    #[test]
    fn discuss_stock_opener() {
        let parsed = parse("I have an idea for a new feature");
        assert!(matches!(parsed.message, ParsedMessage::Discuss { .. }));
    }
}
