const MARKDOWN_SPECIALS: &[char] = &['\\', '*', '_', '~', '`', '|', '>'];

/// Escapes Discord markdown so the text renders literally.
pub(super) fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_SPECIALS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

const CLOSE_FENCE: &str = "\n```";

fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Last line break, else last space, else the hard limit.
fn split_point(s: &str, limit: usize) -> usize {
    let head = &s[..limit];
    head.rfind('\n')
        .or_else(|| head.rfind(' '))
        .map(|i| i + 1)
        .unwrap_or(limit)
}

/// Splits `text` into chunks of at most `max_len` characters. A fenced code
/// block cut by a split is closed at the end of one chunk and reopened, with
/// its language tag, at the start of the next.
pub(super) fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    let mut fence: Option<String> = None;

    while !rest.is_empty() {
        let reopen = fence
            .as_ref()
            .map(|lang| format!("```{lang}\n"))
            .unwrap_or_default();
        let close_reserve = if fence.is_some() { CLOSE_FENCE.len() } else { 0 };
        let room = max_len.saturating_sub(reopen.chars().count() + close_reserve);

        let mut chunk = reopen;
        if rest.chars().count() <= room {
            chunk.push_str(rest);
            if !chunk.trim().is_empty() {
                chunks.push(chunk);
            }
            break;
        }

        let cut = |limit: usize| {
            let mut at = split_point(rest, byte_offset_of_char(rest, limit));
            if at == 0 {
                at = byte_offset_of_char(rest, 1);
            }
            let mut next = fence.clone();
            track_fence(&mut next, &rest[..at]);
            (at, next)
        };
        let (mut at, mut next) = cut(room);
        if next.is_some() && close_reserve == 0 {
            // A fence opened inside this chunk; leave room to close it.
            (at, next) = cut(room.saturating_sub(CLOSE_FENCE.len()));
        }

        let (head, tail) = rest.split_at(at);
        chunk.push_str(head);
        fence = next;
        if fence.is_some() {
            chunk.push_str(CLOSE_FENCE);
        }

        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        rest = tail;
    }

    if chunks.is_empty() {
        chunks.push(text.chars().take(max_len).collect());
    }

    chunks
}

fn track_fence(fence: &mut Option<String>, text: &str) {
    for line in text.lines() {
        if let Some(lang) = line.trim().strip_prefix("```") {
            *fence = match fence {
                Some(_) => None,
                None => Some(lang.trim().to_string()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 2000), vec!["hello"]);
    }

    #[test]
    fn splits_on_line_breaks_within_limit() {
        let text = format!("{}\n{}", "a".repeat(15), "b".repeat(15));

        let chunks = split_message(&text, 20);

        assert_eq!(chunks, vec![format!("{}\n", "a".repeat(15)), "b".repeat(15)]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
    }

    #[test]
    fn open_code_block_is_closed_and_reopened() {
        let text = format!("```rust\n{}\n{}\n```", "x".repeat(20), "y".repeat(20));

        let chunks = split_message(&text, 40);

        assert!(chunks.len() >= 2);
        assert!(chunks[0].ends_with("\n```"));
        assert!(chunks[1].starts_with("```rust\n"));
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
    }

    #[test]
    fn fence_opened_mid_chunk_still_fits_when_closed() {
        let text = format!("```rust\n{}\n{}\n```", "x".repeat(31), "y".repeat(31));

        let chunks = split_message(&text, 40);

        assert!(chunks.iter().all(|c| c.chars().count() <= 40), "{:?}", chunks);
        assert!(chunks[0].ends_with("\n```"));
        assert!(chunks[1].starts_with("```rust\n"));
        let body: String = chunks.concat();
        assert_eq!(body.matches('x').count(), 31);
        assert_eq!(body.matches('y').count(), 31);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "é".repeat(30);

        let chunks = split_message(&text, 10);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() == 10));
    }

    #[test]
    fn escapes_markdown_controls() {
        assert_eq!(escape_markdown("*bold* `code` a_b"), "\\*bold\\* \\`code\\` a\\_b");
        assert_eq!(escape_markdown("plain"), "plain");
    }
}
