use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const VERSION: &str = "0.1.0";

struct CompileArgs {
    arch: String,
    input: PathBuf,
    output: PathBuf,
    meta: PathBuf,
    kernels: Vec<String>,
    flags: Vec<String>,
    options: Vec<(String, String)>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("musajitc {VERSION}");
            Ok(())
        }
        "compile" => run_compile(parse_compile_args(args.collect())?),
        "inspect" => run_inspect(args.collect()),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_compile_args(raw_args: Vec<String>) -> Result<CompileArgs, String> {
    let mut arch = None;
    let mut input = None;
    let mut output = None;
    let mut meta = None;
    let mut kernels = Vec::new();
    let mut flags = Vec::new();
    let mut options = Vec::new();

    let mut i = 0usize;
    while i < raw_args.len() {
        let flag = raw_args[i].as_str();
        i += 1;
        let value = raw_args
            .get(i)
            .cloned()
            .ok_or_else(|| format!("missing value for '{flag}'"))?;
        match flag {
            "--arch" => arch = Some(value),
            "--in" => input = Some(PathBuf::from(value)),
            "--out" => output = Some(PathBuf::from(value)),
            "--meta" => meta = Some(PathBuf::from(value)),
            "--kernels" => kernels.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string),
            ),
            "--flag" => flags.push(value),
            "--opt" => {
                let (key, val) = value
                    .split_once('=')
                    .ok_or_else(|| format!("--opt expects key=value, got '{value}'"))?;
                options.push((key.to_string(), val.to_string()));
            }
            other => return Err(format!("unknown compile flag '{other}'")),
        }
        i += 1;
    }

    Ok(CompileArgs {
        arch: arch.ok_or_else(|| "missing required --arch".to_string())?,
        input: input.ok_or_else(|| "missing required --in".to_string())?,
        output: output.ok_or_else(|| "missing required --out".to_string())?,
        meta: meta.ok_or_else(|| "missing required --meta".to_string())?,
        kernels,
        flags,
        options,
    })
}

fn run_compile(args: CompileArgs) -> Result<(), String> {
    let source = fs::read_to_string(&args.input)
        .map_err(|e| format!("failed to read input {}: {e}", args.input.display()))?;

    let defined = defined_functions(&source);
    let kernels = if args.kernels.is_empty() {
        defined.clone()
    } else {
        args.kernels.clone()
    };
    if kernels.is_empty() {
        return Err(format!("no kernels found in {}", args.input.display()));
    }
    if let Some(missing) = kernels.iter().find(|k| !defined.contains(*k)) {
        return Err(format!("kernel '{missing}' is not defined in {}", args.input.display()));
    }

    let mut image = format!(
        "// musajitc {VERSION} placeholder device image\n// input: {}\n.version 8.0\n.target {}\n.address_size 64\n",
        args.input.display(),
        args.arch
    );
    for flag in &args.flags {
        image.push_str(&format!("// flag: {flag}\n"));
    }
    for (key, value) in &args.options {
        image.push_str(&format!("// option: {key}={value}\n"));
    }
    for kernel in &kernels {
        image.push_str(&format!("\n.visible .entry {kernel}(\n)\n{{\n    ret;\n}}\n"));
    }

    write_file(&args.output, &image, "output")?;
    write_file(&args.meta, &encode_meta_json(&args.arch, &kernels), "metadata")?;

    println!("compiled {} -> {}", args.input.display(), args.output.display());
    println!("metadata {}", args.meta.display());
    Ok(())
}

fn run_inspect(raw_args: Vec<String>) -> Result<(), String> {
    let Some(path) = raw_args.first() else {
        return Err("inspect requires input path".to_string());
    };
    let input = PathBuf::from(path);
    let source = fs::read_to_string(&input)
        .map_err(|e| format!("failed to read input {}: {e}", input.display()))?;
    println!("input={}", input.display());
    println!("bytes={}", source.len());
    println!("lines={}", source.lines().count());
    println!("kernels={}", defined_functions(&source).join(","));
    Ok(())
}

/// Names of `define ... @name(` functions, in order of appearance.
fn defined_functions(source: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in source.lines() {
        let line = line.trim_start();
        if !line.starts_with("define ") {
            continue;
        }
        let Some(at) = line.find('@') else {
            continue;
        };
        let rest = &line[at + 1..];
        let name = rest
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .trim_matches('"');
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn write_file(path: &Path, contents: &str, what: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create {what} dir {}: {e}", parent.display()))?;
    }
    fs::write(path, contents).map_err(|e| format!("failed to write {what} {}: {e}", path.display()))
}

fn encode_meta_json(arch: &str, kernels: &[String]) -> String {
    let symbols = kernels
        .iter()
        .map(|k| format!("\"{}\"", json_escape(k)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{{\n  \"schema_version\": 1,\n  \"tool\": \"musajitc\",\n  \"tool_version\": \"{VERSION}\",\n  \"arch\": \"{}\",\n  \"kernel_symbols\": [{symbols}]\n}}\n",
        json_escape(arch)
    )
}

fn json_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

fn print_help() {
    println!("musajitc {VERSION}");
    println!("Usage:");
    println!("  musajitc compile --arch <mp_xx> --in <image.ir> --out <image.musa> --meta <image.meta.json>");
    println!("                   [--kernels a,b] [--flag <name>]... [--opt <key=value>]...");
    println!("  musajitc inspect <image.ir>");
    println!("  musajitc version");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_defined_functions() {
        let ir = "define void @saxpy(float %a) {\n}\ndeclare void @ext()\n  define internal void @\"scale\"(ptr %x) {\n}\n";
        assert_eq!(defined_functions(ir), vec!["saxpy", "scale"]);
    }

    #[test]
    fn compile_args_need_values() {
        let err = parse_compile_args(vec!["--arch".into()]).err().unwrap();
        assert!(err.contains("--arch"));
        let parsed = parse_compile_args(
            ["--arch", "mp_21", "--in", "a.ir", "--out", "a.musa", "--meta", "a.json", "--kernels", "k1,k2", "--opt", "x=1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap();
        assert_eq!(parsed.kernels, vec!["k1", "k2"]);
        assert_eq!(parsed.options, vec![("x".to_string(), "1".to_string())]);
    }
}
