use crate::store::{Author, ChatMessage};

pub const PREAMBLE: &str = "The following is a conversation with an AI assistant. The assistant is helpful, creative, clever, and very friendly.\n\
\nHuman: Hello, who are you?\
\nAI: I am an AI created by OpenAI. How can I help you today?\
\nHuman: ";
pub const DEFAULT_ASSISTANT_MESSAGE: &str = "How can I help you today?";
pub const ASSISTANT_MARKER: &str = "\nAI: ";
pub const HUMAN_MARKER: &str = "\nHuman: ";
pub const DEFAULT_CONTEXT_LENGTH_MAX: u64 = 4097;

/// Sizes are measured in characters for the preamble, every turn and the
/// generation budget alike.
#[derive(Debug, Clone)]
pub struct WindowParams<'a> {
    pub preamble: &'a str,
    pub context_length_max: u64,
    pub max_tokens_to_generate: u64,
}

impl WindowParams<'static> {
    pub fn new(context_length_max: u64, max_tokens_to_generate: u64) -> Self {
        Self {
            preamble: PREAMBLE,
            context_length_max,
            max_tokens_to_generate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub turns: usize,
    pub trimmed: usize,
}

/// Builds the completion prompt for `human_message` on top of `history`
/// (oldest first).
///
/// The result always ends with `human_message` followed by the assistant
/// marker. Older turns are dropped in human/assistant pairs until the prompt
/// plus the generation budget fits the context length, or only the final turn
/// is left. Never fails.
pub fn build_prompt(history: &[ChatMessage], human_message: &str, params: &WindowParams) -> Prompt {
    let mut rows = alternating_rows(history);
    rows.push(format!("{}{}", human_message, ASSISTANT_MARKER));

    let sizes: Vec<u64> = rows.iter().map(|r| r.chars().count() as u64).collect();
    let mut total = params.preamble.chars().count() as u64
        + sizes.iter().sum::<u64>()
        + params.max_tokens_to_generate;
    let mut start = 0;

    while total > params.context_length_max && rows.len() - start >= 2 {
        total -= sizes[start] + sizes[start + 1];
        start += 2;
    }

    let mut text = String::from(params.preamble);
    for row in &rows[start..] {
        text.push_str(row);
    }

    Prompt {
        text,
        turns: rows.len() - start,
        trimmed: start,
    }
}

/// Keeps only messages that continue the human, assistant, human, ... order
/// and renders each with the marker for the speaker expected after it.
///
/// A message whose author is not the expected next speaker is skipped, so an
/// interleaved transcript degrades to its longest alternating subsequence
/// instead of failing. A trailing unanswered human turn gets the default
/// assistant reply so the sequence is always ready for a new human turn.
fn alternating_rows(history: &[ChatMessage]) -> Vec<String> {
    let mut rows = Vec::with_capacity(history.len() + 2);
    let mut expected = Author::Human;

    for message in history {
        if message.author != expected {
            continue;
        }

        let row = match expected {
            Author::Human => format!("{}{}", message.text, ASSISTANT_MARKER),
            Author::Assistant => format!("{}{}", message.text, HUMAN_MARKER),
        };
        rows.push(row);
        expected = expected.next();
    }

    if expected == Author::Assistant {
        rows.push(format!("{}{}", DEFAULT_ASSISTANT_MESSAGE, HUMAN_MARKER));
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: i64, author: Author, text: &str) -> ChatMessage {
        ChatMessage {
            id,
            user_id: match author {
                Author::Human => 42,
                Author::Assistant => 0,
            },
            author,
            username: String::new(),
            text: text.to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        }
    }

    fn conversation(texts: &[&str]) -> Vec<ChatMessage> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let author = if i % 2 == 0 {
                    Author::Human
                } else {
                    Author::Assistant
                };
                message(i as i64, author, text)
            })
            .collect()
    }

    fn roomy() -> WindowParams<'static> {
        WindowParams::new(DEFAULT_CONTEXT_LENGTH_MAX, 301)
    }

    #[test]
    fn empty_history_yields_preamble_and_new_message() {
        let prompt = build_prompt(&[], "Hello", &roomy());

        assert_eq!(prompt.text, format!("{}Hello\nAI: ", PREAMBLE));
        assert_eq!(prompt.turns, 1);
        assert_eq!(prompt.trimmed, 0);
    }

    #[test]
    fn alternating_history_is_kept_in_order() {
        let history = conversation(&["hi", "hello there", "how are you?", "fine"]);

        let prompt = build_prompt(&history, "great", &roomy());

        let expected = format!(
            "{}hi\nAI: hello there\nHuman: how are you?\nAI: fine\nHuman: great\nAI: ",
            PREAMBLE
        );
        assert_eq!(prompt.text, expected);
        assert_eq!(prompt.turns, 5);
    }

    #[test]
    fn trailing_human_turn_gets_default_reply() {
        let history = conversation(&["hi", "hello", "are you there?"]);

        let prompt = build_prompt(&history, "hello?", &roomy());

        assert!(prompt.text.ends_with(&format!(
            "are you there?\nAI: {}\nHuman: hello?\nAI: ",
            DEFAULT_ASSISTANT_MESSAGE
        )));
        assert_eq!(prompt.turns, 5);
    }

    #[test]
    fn assistant_only_history_is_discarded() {
        let history = vec![
            message(1, Author::Assistant, "first"),
            message(2, Author::Assistant, "second"),
        ];

        let prompt = build_prompt(&history, "Hello", &roomy());

        assert_eq!(prompt.text, format!("{}Hello\nAI: ", PREAMBLE));
    }

    #[test]
    fn out_of_order_turn_is_dropped() {
        let history = vec![
            message(1, Author::Human, "one"),
            message(2, Author::Human, "two"),
            message(3, Author::Assistant, "answer"),
        ];

        let prompt = build_prompt(&history, "next", &roomy());

        assert_eq!(
            prompt.text,
            format!("{}one\nAI: answer\nHuman: next\nAI: ", PREAMBLE)
        );
    }

    #[test]
    fn oversized_history_is_trimmed_in_pairs() {
        let history = conversation(&["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc", "dddddddddd"]);
        let preamble = "P:";
        // preamble 2 + rows (15, 18, 15, 18, 8) + budget 10 = 86, then 53 after one pair
        let params = WindowParams {
            preamble,
            context_length_max: 60,
            max_tokens_to_generate: 10,
        };

        let prompt = build_prompt(&history, "new", &params);

        assert_eq!(prompt.trimmed, 2);
        assert_eq!(prompt.turns, 3);
        assert_eq!(
            prompt.text,
            "P:cccccccccc\nAI: dddddddddd\nHuman: new\nAI: "
        );
    }

    #[test]
    fn trimming_stops_at_final_turn_when_budget_alone_overflows() {
        let history = conversation(&["one", "two", "three", "four"]);
        let params = WindowParams {
            preamble: "P:",
            context_length_max: 10,
            max_tokens_to_generate: 100,
        };

        let prompt = build_prompt(&history, "last", &params);

        assert_eq!(prompt.turns, 1);
        assert_eq!(prompt.trimmed, 4);
        assert_eq!(prompt.text, "P:last\nAI: ");
    }

    #[test]
    fn trimming_leaves_odd_remainder_alone() {
        // Three rows after the placeholder is appended: human, default reply, new message.
        let history = conversation(&["only"]);
        let params = WindowParams {
            preamble: "",
            context_length_max: 1,
            max_tokens_to_generate: 0,
        };

        let prompt = build_prompt(&history, "x", &params);

        assert_eq!(prompt.trimmed, 2);
        assert_eq!(prompt.text, "x\nAI: ");
    }

    #[test]
    fn prompt_always_ends_with_new_message() {
        let long = "long ".repeat(2000);
        let histories = vec![
            Vec::new(),
            conversation(&["a", "b", "c"]),
            vec![
                message(1, Author::Assistant, "x"),
                message(2, Author::Human, "y"),
                message(3, Author::Human, "z"),
            ],
            conversation(&[long.as_str(), "reply"]),
        ];

        for history in &histories {
            let prompt = build_prompt(history, "tail", &roomy());
            assert!(prompt.text.ends_with("tail\nAI: "));
            assert!(prompt.text.starts_with(PREAMBLE));
        }
    }

    #[test]
    fn sizes_are_counted_in_characters() {
        // Each multibyte character counts once.
        let history = conversation(&["日本語", "はい"]);
        let params = WindowParams {
            preamble: "",
            context_length_max: 3 + 5 + 2 + 8 + 2 + 5,
            max_tokens_to_generate: 0,
        };

        let prompt = build_prompt(&history, "ok", &params);

        assert_eq!(prompt.trimmed, 0);
    }
}
