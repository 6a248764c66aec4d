/// Expansion of a single host-name element (the text between dots), per the grammar in
/// hostglob.rs:
///
///   <elem> ::= (literal | "[" <range-list> "]" | "*")+
///   <range-list> ::= <n>("-"<n>)? ("," <n>("-"<n>)?)*
///
/// `expand_element` returns the cross product of the literal pieces and the bracketed numbers, in
/// the order written.  An element containing `*` has no finite expansion and is an error.
use anyhow::{bail, Result};

// Guards against "c[1-4000000000]" eating all memory.
const MAX_EXPANSION: usize = 100_000;

pub fn expand_element(s: &str) -> Result<Vec<String>> {
    let mut parser = Parser::new(s);
    parser.parse_element()?;
    Ok(parser.ss)
}

struct Parser {
    ss: Vec<String>,  // Expansions of the prefix parsed so far
    input: Vec<char>, // Vector of input characters
    i: usize,         // Index into input
}

impl Parser {
    fn new(s: &str) -> Parser {
        Parser {
            ss: vec!["".to_string()],
            input: s.chars().collect::<Vec<char>>(),
            i: 0,
        }
    }

    fn parse_element(&mut self) -> Result<()> {
        if self.at_end() {
            bail!("Empty element in host pattern")
        }
        while !self.at_end() {
            match self.get()? {
                '*' => bail!("Wildcard '*' cannot be expanded"),
                '[' => {
                    let numbers = self.parse_brackets()?;
                    self.push_numbers(&numbers)?;
                }
                ']' => bail!("Unmatched ']' in host pattern"),
                ',' | '.' => bail!("Unexpected separator in host element"),
                c => self.push_char(c),
            }
        }
        Ok(())
    }

    // The '[' has been eaten; this consumes through the ']'.

    fn parse_brackets(&mut self) -> Result<Vec<String>> {
        let mut lst = vec![];
        loop {
            self.parse_range(&mut lst)?;
            match self.get()? {
                ']' => break,
                ',' => {}
                c => bail!("Expected ',' or ']' in range list, found '{c}'"),
            }
        }
        Ok(lst)
    }

    fn parse_range(&mut self, lst: &mut Vec<String>) -> Result<()> {
        let m = self.parse_u32()?;
        if self.peek()? == '-' {
            self.get()?;
            let n = self.parse_u32()?;
            if m > n {
                bail!("Invalid range {m}-{n}");
            }
            if (n - m) as usize >= MAX_EXPANSION {
                bail!("Range {m}-{n} too large");
            }
            lst.extend((m..=n).map(|x| x.to_string()));
        } else {
            lst.push(m.to_string())
        }
        Ok(())
    }

    fn parse_u32(&mut self) -> Result<u32> {
        let start = self.i;
        while !self.at_end() && self.input[self.i].is_ascii_digit() {
            self.i += 1;
        }
        if self.i == start {
            bail!("Expected number in range list");
        }
        let digits = self.input[start..self.i].iter().collect::<String>();
        Ok(digits.parse::<u32>()?)
    }

    fn push_char(&mut self, c: char) {
        for s in &mut self.ss {
            s.push(c);
        }
    }

    fn push_numbers(&mut self, ns: &[String]) -> Result<()> {
        if self.ss.len() * ns.len() > MAX_EXPANSION {
            bail!("Host pattern expands to too many names");
        }
        let mut nvec = Vec::with_capacity(self.ss.len() * ns.len());
        for s in &self.ss {
            for n in ns {
                nvec.push(format!("{s}{n}"));
            }
        }
        self.ss = nvec;
        Ok(())
    }

    fn get(&mut self) -> Result<char> {
        let c = self.peek()?;
        self.i += 1;
        Ok(c)
    }

    fn peek(&self) -> Result<char> {
        if self.at_end() {
            bail!("Unexpected end of host pattern")
        }
        Ok(self.input[self.i])
    }

    fn at_end(&self) -> bool {
        self.i == self.input.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn strs(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect::<Vec<String>>()
    }

    #[test]
    fn test_expand_element() {
        assert_eq!(expand_element("c2-1").unwrap(), strs(&["c2-1"]));
        assert_eq!(
            expand_element("c2-[1,3,5]").unwrap(),
            strs(&["c2-1", "c2-3", "c2-5"])
        );
        assert_eq!(
            expand_element("c3-[1-3,5,9-12]").unwrap(),
            strs(&["c3-1", "c3-2", "c3-3", "c3-5", "c3-9", "c3-10", "c3-11", "c3-12"])
        );
        assert_eq!(
            expand_element("c[1-2]-[3,4]x").unwrap(),
            strs(&["c1-3x", "c1-4x", "c2-3x", "c2-4x"])
        );
    }

    #[test]
    fn test_expand_element_errors() {
        assert!(expand_element("").is_err());
        assert!(expand_element("c*").is_err());
        assert!(expand_element("c[1-").is_err());
        assert!(expand_element("c[3-1]").is_err());
        assert!(expand_element("c[]").is_err());
        assert!(expand_element("c1]").is_err());
        assert!(expand_element("c[1;2]").is_err());
        assert!(expand_element("c[0-4000000000]").is_err());
    }
}
