//! Interactive prompts for options left out on the command line

use std::io::{self, BufRead, Write};

use crate::core::models::{OutputFormat, Resolution, BITRATE_CHOICES, RESOLUTION_CHOICES};

/// Read one trimmed line. `None` on end of input.
pub fn ask_line<R: BufRead, W: Write>(input: &mut R, output: &mut W, prompt: &str) -> io::Result<Option<String>> {
    write!(output, "{}", prompt)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Numbered menu. Returns the chosen index, or `None` when the user just
/// presses Enter (or input ends). Re-asks on anything else.
pub fn ask_choice<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    prompt: &str,
    choices: &[String],
) -> io::Result<Option<usize>> {
    loop {
        writeln!(output, "{}", prompt)?;
        for (i, choice) in choices.iter().enumerate() {
            writeln!(output, "  {}) {}", i + 1, choice)?;
        }
        writeln!(output, "  Enter = skip")?;

        let Some(answer) = ask_line(input, output, "Choice (number): ")? else {
            return Ok(None);
        };
        if answer.is_empty() {
            return Ok(None);
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=choices.len()).contains(&n) => return Ok(Some(n - 1)),
            Ok(_) => writeln!(output, "Number out of range.")?,
            Err(_) => writeln!(output, "Invalid input, please enter a number.")?,
        }
    }
}

pub fn ask_format<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<Option<OutputFormat>> {
    let labels: Vec<String> = OutputFormat::ALL.iter().map(|f| f.label().to_string()).collect();
    Ok(ask_choice(input, output, "Select output format:", &labels)?.map(|i| OutputFormat::ALL[i]))
}

pub fn ask_resolution<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<Option<Resolution>> {
    let labels: Vec<String> = RESOLUTION_CHOICES.iter().map(|r| r.to_string()).collect();
    let picked = ask_choice(input, output, "Select video resolution (max height):", &labels)?;
    Ok(picked.and_then(|i| RESOLUTION_CHOICES[i].parse().ok()))
}

pub fn ask_bitrate<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<Option<u32>> {
    let labels: Vec<String> = BITRATE_CHOICES.iter().map(|b| b.to_string()).collect();
    Ok(ask_choice(input, output, "Select audio bitrate (kbps):", &labels)?.map(|i| BITRATE_CHOICES[i]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run<T>(answers: &str, ask: impl FnOnce(&mut Cursor<Vec<u8>>, &mut Vec<u8>) -> io::Result<T>) -> (T, String) {
        let mut input = Cursor::new(answers.as_bytes().to_vec());
        let mut output = Vec::new();
        let value = ask(&mut input, &mut output).unwrap();
        (value, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_choice_retries_until_valid() {
        let choices = vec!["a".to_string(), "b".to_string()];
        let (picked, shown) = run("x\n9\n2\n", |i, o| ask_choice(i, o, "Pick:", &choices));
        assert_eq!(picked, Some(1));
        assert!(shown.contains("Invalid input"));
        assert!(shown.contains("Number out of range."));
        assert!(shown.contains("  2) b"));
    }

    #[test]
    fn test_enter_and_eof_skip() {
        let choices = vec!["a".to_string()];
        assert_eq!(run("\n", |i, o| ask_choice(i, o, "Pick:", &choices)).0, None);
        assert_eq!(run("", |i, o| ask_choice(i, o, "Pick:", &choices)).0, None);
    }

    #[test]
    fn test_typed_prompts() {
        assert_eq!(run("3\n", ask_format).0, Some(OutputFormat::Mp3));
        assert_eq!(run("3\n", ask_resolution).0, Some(Resolution::MaxHeight(720)));
        assert_eq!(run("1\n", ask_resolution).0, Some(Resolution::Best));
        assert_eq!(run("4\n", ask_bitrate).0, Some(128));
    }

    #[test]
    fn test_ask_line_trims() {
        let (line, shown) = run("  https://media.test/v \n", |i, o| ask_line(i, o, "Video URL: "));
        assert_eq!(line.as_deref(), Some("https://media.test/v"));
        assert_eq!(shown, "Video URL: ");
    }
}
