//! `sw uri`: handle a `sw:` protocol invocation.
//!
//! The binary registers as the handler for the `sw:` URI scheme. The first
//! argument names the verb (`sw:sdir`, `sw:install`, `sw:remove`,
//! `sw:build`); everything after it is URL-decoded, with `%20` splitting
//! an argument into separate tokens, and forwarded verbatim to the verb's
//! handler.

use std::process::ExitCode;

use anyhow::{Result, bail};

use super::{build, install, new_read_only_context, parse_reference, remove};

pub fn run(args: &[String], registry: Option<&str>) -> Result<ExitCode> {
  let Some((verb, rest)) = args.split_first() else {
    bail!("usage: sw uri sw:<verb> [args...]");
  };

  let mut tokens = Vec::new();
  for arg in rest {
    tokens.extend(decode_tokens(arg)?);
  }

  match verb.as_str() {
    "sw:sdir" => sdir(&tokens, registry),
    "sw:install" => install::run(&tokens, registry),
    "sw:remove" => {
      let Some(package) = tokens.first() else {
        bail!("sw:remove requires a package");
      };
      remove::run(package, registry)
    }
    "sw:build" => build::run(&tokens, registry),
    other => bail!("unknown uri verb '{other}'"),
  }
}

/// Print the source directory of an installed package.
fn sdir(tokens: &[String], registry: Option<&str>) -> Result<ExitCode> {
  let Some(package) = tokens.first() else {
    bail!("sw:sdir requires a package");
  };
  let ctx = new_read_only_context(registry)?;
  let reference = parse_reference(package)?;
  let Some(id) = ctx.db().match_installed(&reference) else {
    bail!("package '{reference}' is not installed");
  };
  println!("{}", ctx.storage().source_dir(&id).display());
  Ok(ExitCode::SUCCESS)
}

/// URL-decode one argument; `%20` separates tokens.
fn decode_tokens(arg: &str) -> Result<Vec<String>> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut rest = arg;
  while !rest.is_empty() {
    if let Some(after) = rest.strip_prefix('%') {
      let hex = after
        .get(..2)
        .ok_or_else(|| anyhow::anyhow!("truncated percent escape in '{arg}'"))?;
      let value =
        u8::from_str_radix(hex, 16).map_err(|_| anyhow::anyhow!("bad percent escape '%{hex}'"))?;
      if value == b' ' {
        if !current.is_empty() {
          tokens.push(std::mem::take(&mut current));
        }
      } else {
        current.push(value as char);
      }
      rest = &after[2..];
    } else {
      let ch = rest.chars().next().expect("rest is non-empty");
      current.push(ch);
      rest = &rest[ch.len_utf8()..];
    }
  }
  if !current.is_empty() {
    tokens.push(current);
  }
  Ok(tokens)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_argument_is_one_token() {
    assert_eq!(decode_tokens("org.demo.leaf").unwrap(), vec!["org.demo.leaf"]);
  }

  #[test]
  fn percent_twenty_splits_tokens() {
    assert_eq!(
      decode_tokens("org.demo.leaf%20org.demo.other").unwrap(),
      vec!["org.demo.leaf", "org.demo.other"]
    );
  }

  #[test]
  fn other_escapes_decode_in_place() {
    assert_eq!(decode_tokens("a%2Bb").unwrap(), vec!["a+b"]);
  }

  #[test]
  fn truncated_escape_is_an_error() {
    assert!(decode_tokens("broken%2").is_err());
    assert!(decode_tokens("broken%zz").is_err());
  }
}
