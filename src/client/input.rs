//! Keyboard events to host input bytes.
//!
//! Printable characters go out as UTF-8; named keys use the byte the host's
//! line discipline expects (CR for Enter, DEL for Backspace) or their
//! conventional CSI/SS3 escape sequences. Ctrl+letter collapses to the
//! control byte and Alt prefixes ESC. Events that carry no keystroke, such
//! as bare modifiers or key releases, encode to nothing.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

pub fn encode_key_event(key: &KeyEvent) -> Option<Vec<u8>> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    let mut bytes = Vec::new();
    if key.modifiers.contains(KeyModifiers::ALT) {
        bytes.push(0x1b);
    }
    match key.code {
        KeyCode::Char(c) => {
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                let lower = c.to_ascii_lowercase();
                if lower.is_ascii_lowercase() {
                    bytes.push((lower as u8 - b'a') + 1);
                } else {
                    return None;
                }
            } else {
                let mut utf8 = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
        }
        KeyCode::Enter => bytes.push(0x0d),
        KeyCode::Backspace => bytes.push(0x7f),
        KeyCode::Tab => bytes.push(0x09),
        KeyCode::Esc => bytes.push(0x1b),
        KeyCode::Up => bytes.extend_from_slice(b"\x1b[A"),
        KeyCode::Down => bytes.extend_from_slice(b"\x1b[B"),
        KeyCode::Right => bytes.extend_from_slice(b"\x1b[C"),
        KeyCode::Left => bytes.extend_from_slice(b"\x1b[D"),
        KeyCode::Home => bytes.extend_from_slice(b"\x1b[H"),
        KeyCode::End => bytes.extend_from_slice(b"\x1b[F"),
        KeyCode::PageUp => bytes.extend_from_slice(b"\x1b[5~"),
        KeyCode::PageDown => bytes.extend_from_slice(b"\x1b[6~"),
        KeyCode::Delete => bytes.extend_from_slice(b"\x1b[3~"),
        KeyCode::Insert => bytes.extend_from_slice(b"\x1b[2~"),
        KeyCode::F(n) => bytes.extend_from_slice(function_key_sequence(n)?),
        _ => return None,
    }
    Some(bytes)
}

fn function_key_sequence(n: u8) -> Option<&'static [u8]> {
    let seq: &[u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn printable_characters_are_utf8() {
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('a'), KeyModifiers::NONE)),
            Some(b"a".to_vec())
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('é'), KeyModifiers::NONE)),
            Some("é".as_bytes().to_vec())
        );
    }

    #[test]
    fn named_keys_use_host_bytes() {
        assert_eq!(
            encode_key_event(&key(KeyCode::Enter, KeyModifiers::NONE)),
            Some(vec![0x0d])
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Backspace, KeyModifiers::NONE)),
            Some(vec![0x7f])
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Tab, KeyModifiers::NONE)),
            Some(vec![0x09])
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Esc, KeyModifiers::NONE)),
            Some(vec![0x1b])
        );
    }

    #[test]
    fn arrows_and_function_keys_use_escape_sequences() {
        assert_eq!(
            encode_key_event(&key(KeyCode::Up, KeyModifiers::NONE)),
            Some(b"\x1b[A".to_vec())
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::F(1), KeyModifiers::NONE)),
            Some(b"\x1bOP".to_vec())
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::F(5), KeyModifiers::NONE)),
            Some(b"\x1b[15~".to_vec())
        );
    }

    #[test]
    fn control_letters_collapse_to_control_bytes() {
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(vec![0x03])
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('Z'), KeyModifiers::CONTROL)),
            Some(vec![0x1a])
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('1'), KeyModifiers::CONTROL)),
            None
        );
    }

    #[test]
    fn alt_prefixes_escape() {
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('x'), KeyModifiers::ALT)),
            Some(vec![0x1b, b'x'])
        );
        assert_eq!(
            encode_key_event(&key(KeyCode::Char('b'), KeyModifiers::ALT | KeyModifiers::CONTROL)),
            Some(vec![0x1b, 0x02])
        );
    }

    #[test]
    fn modifier_only_and_release_events_are_empty() {
        assert_eq!(
            encode_key_event(&key(KeyCode::Null, KeyModifiers::NONE)),
            None
        );
        let mut release = key(KeyCode::Char('a'), KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert_eq!(encode_key_event(&release), None);
    }
}
