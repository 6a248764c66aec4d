/// Non-allocating tokenizer for the key=value CSV dialect used by the sample and sacct files.
///
/// What we're parsing:
///
///  - UTF-8, one record per line, lines terminated by LF; the terminator is optional at EOF
///  - blank lines are empty records
///  - no header line, and the number of fields varies between lines
///  - fields are separated by commas and may be empty
///  - a field may be enclosed in double quotes, in which case it may contain commas, and a
///    double quote is written as two double quotes; newlines are never allowed inside a field
///  - a line may be at most MAXLINE bytes long
///
/// The tokenizer yields Token::Field(start, lim, eqloc), Token::EOL and Token::EOF.  `start..lim`
/// indexes the field text in the internal buffer, `eqloc` is the index just past the first `=` in
/// the field, or EQ_SENTINEL if there is none.  The indices are valid until the next call to
/// get().
///
/// A syntax error is reported as an error that is not an io::Error.  After a syntax error the
/// caller should call scan_eol() to resynchronize at the start of the next line.
use anyhow::{bail, Result};
use std::io;

pub enum Token {
    Field(usize, usize, usize),
    EOL,
    EOF,
}

pub const EQ_SENTINEL: usize = usize::MAX;

const BUFSIZ: usize = 65536;
const MAXLINE: usize = 8192;

pub struct Tokenizer<R: io::Read> {
    ix: usize,
    lim: usize,
    start_of_line: bool,
    lineno: usize,
    reader: R,
    buf: Box<[u8]>,
}

impl<R: io::Read> Tokenizer<R> {
    pub fn new(reader: R) -> Tokenizer<R> {
        let mut buf = vec![0u8; BUFSIZ].into_boxed_slice();
        // \n is a sentinel at buf[lim] at all times.
        buf[0] = b'\n';
        Tokenizer {
            ix: 0,
            lim: 0,
            start_of_line: true,
            lineno: 1,
            reader,
            buf,
        }
    }

    /// 1-based number of the line the tokenizer is on, for diagnostics.
    pub fn lineno(&self) -> usize {
        self.lineno
    }

    // The tokenizer only produces fields from valid UTF-8 input, but a partially written record
    // may have been cut in the middle of a character, so check.
    pub fn get_str(&self, start: usize, lim: usize) -> &str {
        std::str::from_utf8(&self.buf[start..lim]).unwrap_or("")
    }

    pub fn get_string(&self, start: usize, lim: usize) -> String {
        self.get_str(start, lim).to_string()
    }

    pub fn buf_at(&self, loc: usize) -> u8 {
        self.buf[loc]
    }

    /// Given start and non-sentinel eqloc values returned with a Token::Field, check whether the
    /// field is `<tag>=...`.
    pub fn match_tag(&self, tag: &[u8], start: usize, eqloc: usize) -> bool {
        start + tag.len() + 1 == eqloc && &self.buf[start..eqloc - 1] == tag
    }

    /// Skip input until just past the next newline or until EOF.  Used to recover after a syntax
    /// error or to discard the rest of a rejected record.
    pub fn scan_eol(&mut self) -> Result<()> {
        loop {
            self.maybe_refill()?;
            if self.ix == self.lim {
                self.start_of_line = true;
                return Ok(());
            }
            if self.buf[self.ix] == b'\n' {
                self.ix += 1;
                self.lineno += 1;
                self.start_of_line = true;
                return Ok(());
            }
            self.ix += 1;
        }
    }

    pub fn get(&mut self) -> Result<Token> {
        self.maybe_refill()?;

        if self.buf[self.ix] == b'\n' {
            if self.ix == self.lim {
                return Ok(Token::EOF);
            }
            self.ix += 1;
            self.lineno += 1;
            self.start_of_line = true;
            return Ok(Token::EOL);
        }

        if !self.start_of_line {
            // The previous field ended at a comma.
            self.ix += 1;
        }
        self.start_of_line = false;

        let mut eqloc = EQ_SENTINEL;
        match self.buf[self.ix] {
            b'\n' | b',' => Ok(Token::Field(self.ix, self.ix, eqloc)),
            b'"' => {
                // Doubled quotes are collapsed in place.
                self.ix += 1;
                let startix = self.ix;
                let mut destix = startix;
                loop {
                    match self.buf[self.ix] {
                        b'\n' => {
                            bail!("Line {}: unexpected end of line in quoted field", self.lineno)
                        }
                        b'"' => {
                            self.ix += 1;
                            if self.buf[self.ix] != b'"' {
                                if self.buf[self.ix] != b',' && self.buf[self.ix] != b'\n' {
                                    bail!("Line {}: junk after quoted field", self.lineno)
                                }
                                return Ok(Token::Field(startix, destix, eqloc));
                            }
                        }
                        b'=' if eqloc == EQ_SENTINEL => {
                            eqloc = destix + 1;
                        }
                        _ => {}
                    }
                    self.buf[destix] = self.buf[self.ix];
                    destix += 1;
                    self.ix += 1;
                }
            }
            _ => {
                let startix = self.ix;
                loop {
                    match self.buf[self.ix] {
                        b'\n' | b',' => return Ok(Token::Field(startix, self.ix, eqloc)),
                        b'=' if eqloc == EQ_SENTINEL => eqloc = self.ix + 1,
                        b'"' => bail!("Line {}: unexpected '\"'", self.lineno),
                        _ => {}
                    }
                    self.ix += 1;
                }
            }
        }
    }

    fn maybe_refill(&mut self) -> Result<()> {
        while self.lim - self.ix < MAXLINE {
            if self.ix != 0 {
                let n = self.lim - self.ix;
                self.buf.copy_within(self.ix..self.lim + 1, 0);
                self.ix = 0;
                self.lim = n;
            }
            let nread = match self.reader.read(&mut self.buf[self.lim..BUFSIZ - 1]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.lim += nread;
            self.buf[self.lim] = b'\n';
            if nread == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn expect_field<R: io::Read>(t: &mut Tokenizer<R>, text: &str, eq: Option<usize>) {
    match t.get().unwrap() {
        Token::Field(a, b, c) => {
            assert_eq!(t.get_str(a, b), text);
            match eq {
                Some(k) => assert_eq!(c, a + k),
                None => assert_eq!(c, EQ_SENTINEL),
            }
        }
        _ => panic!("Expected field {text}"),
    }
}

#[cfg(test)]
fn expect_eol<R: io::Read>(t: &mut Tokenizer<R>) {
    assert!(matches!(t.get().unwrap(), Token::EOL));
}

#[cfg(test)]
fn expect_eof<R: io::Read>(t: &mut Tokenizer<R>) {
    assert!(matches!(t.get().unwrap(), Token::EOF));
}

// Empty fields (also at EOL), quoted fields with commas, quotes and `=` in them, blank lines, and
// an unterminated last line.

#[test]
fn test_csv_tokenizer_fields() {
    let text = "a,b=1,cc=2,,\"f=1,2\",\"g,\"\"y\"\"\",\n\nA,B";
    let mut t = Tokenizer::new(text.as_bytes());
    expect_field(&mut t, "a", None);
    expect_field(&mut t, "b=1", Some(2));
    expect_field(&mut t, "cc=2", Some(3));
    expect_field(&mut t, "", None);
    expect_field(&mut t, "f=1,2", Some(2));
    expect_field(&mut t, "g,\"y\"", None);
    expect_field(&mut t, "", None);
    expect_eol(&mut t);
    expect_eol(&mut t);
    expect_field(&mut t, "A", None);
    expect_field(&mut t, "B", None);
    expect_eof(&mut t);
    assert_eq!(t.lineno(), 3);
}

#[test]
fn test_csv_tokenizer_trailing_comma_at_eof() {
    let mut t = Tokenizer::new("a,".as_bytes());
    expect_field(&mut t, "a", None);
    expect_field(&mut t, "", None);
    expect_eof(&mut t);
}

#[test]
fn test_csv_tokenizer_recovery() {
    // Newline inside quotes, then a stray quote, then a good line.
    let text = "a,\"hi\nx=1,y\"z\nok=1\n";
    let mut t = Tokenizer::new(text.as_bytes());
    expect_field(&mut t, "a", None);
    assert!(t.get().is_err());
    t.scan_eol().unwrap();
    expect_field(&mut t, "x=1", Some(2));
    assert!(t.get().is_err());
    t.scan_eol().unwrap();
    expect_field(&mut t, "ok=1", Some(3));
    expect_eol(&mut t);
    expect_eof(&mut t);
}

#[test]
fn test_csv_tokenizer_match_tag() {
    let mut t = Tokenizer::new("cpu%=12,cpukib=3".as_bytes());
    if let Token::Field(a, _, c) = t.get().unwrap() {
        assert!(t.match_tag(b"cpu%", a, c));
        assert!(!t.match_tag(b"cpu", a, c));
        assert!(!t.match_tag(b"cpukib", a, c));
    } else {
        panic!("Expected field");
    }
    if let Token::Field(a, _, c) = t.get().unwrap() {
        assert!(t.match_tag(b"cpukib", a, c));
    } else {
        panic!("Expected field");
    }
}

// Lines longer than the refill threshold are still tokenized as long as they fit in the buffer,
// and input arriving in small reads is reassembled.

#[test]
fn test_csv_tokenizer_small_reads() {
    struct Trickle<'a>(&'a [u8]);
    impl<'a> io::Read for Trickle<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }
    let mut long = "k=".to_string();
    long.push_str(&"x".repeat(3000));
    let text = format!("{long},v=1\nw=2");
    let mut t = Tokenizer::new(Trickle(text.as_bytes()));
    expect_field(&mut t, &long, Some(2));
    expect_field(&mut t, "v=1", Some(2));
    expect_eol(&mut t);
    expect_field(&mut t, "w=2", Some(2));
    expect_eof(&mut t);
}

#[test]
fn test_csv_tokenizer_io_error() {
    struct Failing;
    impl io::Read for Failing {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }
    let mut t = Tokenizer::new(Failing);
    let e = t.get().err().unwrap();
    assert!(e.downcast_ref::<io::Error>().is_some());
}
