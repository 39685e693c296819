//! Best-effort parsing of a JSON document that is still being streamed.
//!
//! Tool inputs arrive as text fragments. [`parse_partial`] closes whatever is
//! open at the end of the fragment (strings, arrays, objects) and drops any
//! trailing token that cannot be completed (a dangling key, a half-typed
//! literal, a trailing comma). It never panics and returns `None` when no
//! useful value can be recovered.

use serde_json::Value;

/// Parse `text` as JSON, repairing a truncated tail if needed.
pub fn parse_partial(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    let repaired = repair(text)?;
    serde_json::from_str(&repaired).ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Key,
    Colon,
    Value,
    Next,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frame {
    Object(Slot),
    Array,
}

#[derive(Default)]
struct Scanner {
    stack: Vec<Frame>,
    safe_end: usize,
    safe_closers: String,
}

impl Scanner {
    fn closers(&self) -> String {
        self.stack
            .iter()
            .rev()
            .map(|f| match f {
                Frame::Object(_) => '}',
                Frame::Array => ']',
            })
            .collect()
    }

    fn mark_safe(&mut self, end: usize) {
        self.safe_end = end;
        self.safe_closers = self.closers();
    }

    fn value_done(&mut self, end: usize) {
        if let Some(Frame::Object(slot)) = self.stack.last_mut() {
            if *slot != Slot::Value {
                return;
            }
            *slot = Slot::Next;
        }
        self.mark_safe(end);
    }

    fn set_slot(&mut self, slot: Slot) {
        if let Some(Frame::Object(s)) = self.stack.last_mut() {
            *s = slot;
        }
    }
}

fn repair(text: &str) -> Option<String> {
    let mut sc = Scanner::default();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escaped = false;
    let mut scalar_start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if string_is_key {
                    sc.set_slot(Slot::Colon);
                } else {
                    sc.value_done(i + 1);
                }
            }
            continue;
        }

        if let Some(start) = scalar_start {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+') {
                continue;
            }
            scalar_start = None;
            serde_json::from_str::<Value>(&text[start..i]).ok()?;
            sc.value_done(i);
        }

        match c {
            '{' => {
                sc.stack.push(Frame::Object(Slot::Key));
                sc.mark_safe(i + 1);
            }
            '[' => {
                sc.stack.push(Frame::Array);
                sc.mark_safe(i + 1);
            }
            '}' | ']' => {
                sc.stack.pop()?;
                sc.value_done(i + 1);
            }
            '"' => {
                in_string = true;
                string_is_key = matches!(sc.stack.last(), Some(Frame::Object(Slot::Key)));
            }
            ':' => sc.set_slot(Slot::Value),
            ',' => sc.set_slot(Slot::Key),
            c if c.is_whitespace() => {}
            _ => scalar_start = Some(i),
        }
    }

    if in_string && !string_is_key {
        let mut body = text;
        if escaped {
            body = &body[..body.len() - 1];
        }
        body = trim_incomplete_unicode_escape(body);
        return Some(format!("{body}\"{}", sc.closers()));
    }

    if let Some(start) = scalar_start {
        if serde_json::from_str::<Value>(&text[start..]).is_ok() {
            sc.value_done(text.len());
        }
    }

    if sc.safe_end == 0 {
        return None;
    }
    Some(format!("{}{}", &text[..sc.safe_end], sc.safe_closers))
}

fn trim_incomplete_unicode_escape(body: &str) -> &str {
    let Some(pos) = body.rfind("\\u") else {
        return body;
    };
    let tail = &body[pos + 2..];
    if tail.len() < 4 && tail.chars().all(|c| c.is_ascii_hexdigit()) {
        &body[..pos]
    } else {
        body
    }
}
