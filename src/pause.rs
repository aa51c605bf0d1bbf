use std::io::{self, BufRead, Write};

pub const PAUSE_PROMPT: &str = "Warning - An error has occurred. Type 'exit' to end program:";

/// Keeps a console window open after a failure until the user types `exit`.
///
/// Does nothing when `err` is `None`.
pub fn pause_exit<E: ?Sized>(err: Option<&E>) {
    let stdin = io::stdin();
    let _ = pause_exit_with(err, &mut stdin.lock(), &mut io::stdout());
}

/// [`pause_exit`] over explicit streams. Returns once a line reading `exit`
/// (any case) arrives or the input is exhausted.
pub fn pause_exit_with<E, R, W>(err: Option<&E>, input: &mut R, output: &mut W) -> io::Result<()>
where
    E: ?Sized,
    R: BufRead,
    W: Write,
{
    if err.is_none() {
        return Ok(());
    }

    let mut line = Vec::new();
    loop {
        writeln!(output)?;
        writeln!(output, "{PAUSE_PROMPT}")?;
        output.flush()?;

        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        if String::from_utf8_lossy(&line)
            .trim()
            .eq_ignore_ascii_case("exit")
        {
            return Ok(());
        }
    }
}
