use chrono::Local;

use crate::action::{format_vocabulary, ModelTurn};

/// Instructions describing the reply format and the action vocabulary.
pub fn system_message() -> String {
    format!(
        r#"You are a browser automation assistant. Respond with exactly ONE JSON object:

{{
  "thought": "...",
  "action": "actionName(arguments)"
}}

You can ONLY use the actions defined below and NOTHING else:
{actions}

RULES:
1. EXACTLY one "action" per message.
2. No extra keys or text outside the JSON.
3. Arguments are positional string literals, in the order listed above.
4. When the task is done, use "finish()". If it cannot be done, use "fail()".

EXAMPLES:
{{"thought": "Click the submit button", "action": "click(\"12\")"}}
{{"thought": "Type the username", "action": "setValue(\"4\", \"exampleUser\")"}}
{{"thought": "Wait for the page to load", "action": "wait()"}}
{{"thought": "The task is complete", "action": "finish()"}}
"#,
        actions = format_vocabulary()
    )
}

/// Prepended by the gateway to every system message it forwards.
pub fn hardened_preamble() -> String {
    let names = crate::action::ACTIONS
        .iter()
        .map(|a| a.name)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Reply with a single JSON object containing \"thought\" and \"action\". \
         The action name MUST be one of: {names}. Never invent other actions. \
         Do not answer with fail() unless the task is truly impossible on this page."
    )
}

/// Build the user prompt for one turn.
pub fn format_prompt(instructions: &str, history: &[ModelTurn], page_contents: &str) -> String {
    let mut previous = String::new();
    if !history.is_empty() {
        let serialized = history
            .iter()
            .map(|turn| format!("Thought: {}\nAction:{}", turn.thought, turn.action.to_json()))
            .collect::<Vec<_>>()
            .join("\n\n");
        previous = format!("You have already taken the following actions: \n{serialized}\n\n");
    }

    let mut prompt = format!(
        "The user requests the following task:\n\n{instructions}\n\n{previous}\n\nCurrent time: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    if !page_contents.is_empty() {
        prompt.push_str("\nCurrent page contents:\n");
        prompt.push_str(page_contents);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;

    #[test]
    fn prompt_embeds_history_and_page() {
        let history = vec![ModelTurn::new("open search", Action::Click { target_id: "3".into() })];
        let prompt = format_prompt("find a fox", &history, "<input id=7>");
        assert!(prompt.starts_with("The user requests the following task:\n\nfind a fox"));
        assert!(prompt.contains("Thought: open search\nAction:{\"name\":\"click\",\"args\":{\"targetId\":\"3\"}}"));
        assert!(prompt.contains("Current time: "));
        assert!(prompt.ends_with("Current page contents:\n<input id=7>"));
    }

    #[test]
    fn prompt_without_history_or_page() {
        let prompt = format_prompt("x", &[], "");
        assert!(!prompt.contains("already taken"));
        assert!(!prompt.contains("Current page contents"));
    }

    #[test]
    fn system_message_lists_vocabulary() {
        let msg = system_message();
        assert!(msg.contains("1. click(targetId: string)"));
        assert!(msg.contains("setValueAndEnter"));
        assert!(hardened_preamble().contains("click, setValue, scroll, navigate, setValueAndEnter, wait, finish, fail"));
    }
}
