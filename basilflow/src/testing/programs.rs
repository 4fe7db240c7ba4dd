//! Shell scripts standing in for external programs.

use crate::errors::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable `/bin/sh` script called `name` into `dir`.
pub fn fake_program(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

const FABBER_SCRIPT: &str = r#"
out=""
data=""
for a in "$@"; do
  case "$a" in
    --output=*) out="${a#--output=}" ;;
    --data=*) data="${a#--data=}" ;;
  esac
done
for ext in "" .nii .nii.gz; do
  if [ -f "$data$ext" ]; then data="$data$ext"; break; fi
done
mkdir -p "$out"
echo "$@" > "$out/args"
echo "Iteration 1: 50%"
cp "$data" "$out/finalMVN.nii.gz"
cp "$data" "$out/mean_ftiss.nii.gz"
case " $* " in
  *" --save-std "*) cp "$data" "$out/std_ftiss.nii.gz" ;;
esac
echo "Iteration 2: 100%"
"#;

/// Writes a stand-in for `fabber_<model_group>` into `dir`.
///
/// The script copies its input data to `finalMVN` and `mean_ftiss` (plus
/// `std_ftiss` when asked to save standard deviations) in the output
/// directory, records its arguments in `args` and prints `50%` and `100%`
/// progress lines.
pub fn fake_fabber(dir: &Path, model_group: &str) -> Result<PathBuf> {
    fake_program(dir, &format!("fabber_{model_group}"), FABBER_SCRIPT)
}
