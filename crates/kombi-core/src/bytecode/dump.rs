//! Hex dump of `.rodata`: 16 bytes per line in 2-byte groups, followed by
//! the printable characters (`.` for the rest).

use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Renders `.rodata` under a `.rodata` heading.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::from(".rodata\n");
    for (n, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:08x}:  ", n * BYTES_PER_LINE);
        for pair in chunk.chunks(2) {
            match pair {
                [a, b] => { let _ = write!(out, "{a:02x}{b:02x} "); }
                [a] => { let _ = write!(out, "{a:02x}   "); }
                _ => {}
            }
        }
        let missing = (BYTES_PER_LINE - chunk.len()) / 2 * 5;
        let _ = write!(out, " {:missing$}", "");
        out.extend(chunk.iter().map(|&b| if b == b' ' || b.is_ascii_graphic() { char::from(b) } else { '.' }));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_line() {
        assert_eq!(
            hexdump(b"Hello, world!\n\0X"),
            ".rodata\n00000000:  4865 6c6c 6f2c 2077 6f72 6c64 210a 0058  Hello, world!..X\n"
        );
    }

    #[test]
    fn partial_line_is_padded() {
        let dump = hexdump(b"0123456789abcdefok\0");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], format!("00000010:  6f6b 00   {:31}ok.", ""));
        // character column lines up with the full line above
        assert_eq!(lines[1].len() - 16, lines[2].len() - 3);
    }

    #[test]
    fn empty() {
        assert_eq!(hexdump(&[]), ".rodata\n");
    }
}
