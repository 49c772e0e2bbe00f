use libmcrunner::MAX_LINE_LEN;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// Bytes to send back to the client terminal.
    Echo(Vec<u8>),
    /// A completed line, without its terminator.
    Line(String),
    /// The user ended input (Ctrl-C, or Ctrl-D on an empty line).
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Csi,
}

/// Minimal line discipline for a remote console: echo, backspace and Enter.
/// Cursor movement and other escape sequences are swallowed, as is typing
/// past [`MAX_LINE_LEN`] bytes.
#[derive(Debug)]
pub struct LineEditor {
    buf: Vec<u8>,
    echo: bool,
    after_cr: bool,
    escape: Escape,
}

impl LineEditor {
    pub fn new(echo: bool) -> Self {
        Self {
            buf: Vec::new(),
            echo,
            after_cr: false,
            escape: Escape::None,
        }
    }

    pub fn feed(&mut self, input: &[u8]) -> Vec<EditorEvent> {
        let mut events = Vec::new();
        let mut echo = Vec::new();

        for &byte in input {
            let after_cr = std::mem::replace(&mut self.after_cr, false);

            match self.escape {
                Escape::Start => {
                    self.escape = if byte == b'[' || byte == b'O' {
                        Escape::Csi
                    } else {
                        Escape::None
                    };
                    continue;
                }
                Escape::Csi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    self.after_cr = byte == b'\r';
                    echo.extend_from_slice(b"\r\n");
                    self.flush_echo(&mut events, &mut echo);
                    let line = String::from_utf8_lossy(&self.buf).into_owned();
                    self.buf.clear();
                    events.push(EditorEvent::Line(line));
                }
                DEL | BACKSPACE => {
                    if self.pop_char() {
                        echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                CTRL_C => {
                    self.flush_echo(&mut events, &mut echo);
                    events.push(EditorEvent::Eof);
                    return events;
                }
                CTRL_D if self.buf.is_empty() => {
                    self.flush_echo(&mut events, &mut echo);
                    events.push(EditorEvent::Eof);
                    return events;
                }
                ESC => self.escape = Escape::Start,
                b if b < 0x20 => {}
                _ if self.buf.len() >= MAX_LINE_LEN => {}
                b => {
                    self.buf.push(b);
                    echo.push(b);
                }
            }
        }

        self.flush_echo(&mut events, &mut echo);
        events
    }

    fn flush_echo(&self, events: &mut Vec<EditorEvent>, echo: &mut Vec<u8>) {
        if self.echo && !echo.is_empty() {
            events.push(EditorEvent::Echo(std::mem::take(echo)));
        }
        echo.clear();
    }

    /// Remove the last UTF-8 character from the buffer.
    fn pop_char(&mut self) -> bool {
        let Some(mut idx) = self.buf.len().checked_sub(1) else {
            return false;
        };
        while idx > 0 && (self.buf[idx] & 0xc0) == 0x80 {
            idx -= 1;
        }
        self.buf.truncate(idx);
        true
    }
}
