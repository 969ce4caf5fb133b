use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use luahost::mlua;
use luahost::{BuildConfig, ScriptError, Vm, VmSettings};
use luahost_debugger::{DebuggerClient, DEBUGGER_PORT};

const VERSION: &str = "luahost 0.1 (Lua 5.4)";
const DEBUGGER_CONNECT_WAIT: Duration = Duration::from_secs(2);

fn print_usage() {
    eprintln!("usage: luahost [options] [script [args]]");
    eprintln!("Available options are:");
    eprintln!("  -e stat   execute string 'stat'");
    eprintln!("  -I path   add 'path' to the script search paths");
    eprintln!("  -s file   read VM settings from JSON 'file'");
    eprintln!("  -c cfg    build config: debug, developer (default) or ship");
    eprintln!("  -d host   attach the debugger at 'host' (port {DEBUGGER_PORT} unless given)");
    eprintln!("  -p        print memory attribution on exit");
    eprintln!("  -v        show version information");
    eprintln!("  --        stop handling options");
    eprintln!("  -         stop handling options and execute stdin");
}

#[derive(Default)]
struct Options {
    execute_strings: Vec<String>,
    include_paths: Vec<PathBuf>,
    settings_file: Option<String>,
    build_config: Option<BuildConfig>,
    debugger: Option<String>,
    profile: bool,
    show_version: bool,
    script_file: Option<String>,
    script_args: Vec<String>,
    read_stdin: bool,
}

fn needs_arg<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("'{flag}' needs argument"))
}

fn parse_build_config(s: &str) -> Result<BuildConfig, String> {
    match s.to_ascii_lowercase().as_str() {
        "debug" => Ok(BuildConfig::Debug),
        "developer" => Ok(BuildConfig::Developer),
        "ship" => Ok(BuildConfig::Ship),
        _ => Err(format!("unknown build config '{s}'")),
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-e" => {
                i += 1;
                opts.execute_strings.push(needs_arg(args, i, arg)?.to_string());
            }
            "-I" => {
                i += 1;
                opts.include_paths.push(PathBuf::from(needs_arg(args, i, arg)?));
            }
            "-s" => {
                i += 1;
                opts.settings_file = Some(needs_arg(args, i, arg)?.to_string());
            }
            "-c" => {
                i += 1;
                opts.build_config = Some(parse_build_config(needs_arg(args, i, arg)?)?);
            }
            "-d" => {
                i += 1;
                opts.debugger = Some(needs_arg(args, i, arg)?.to_string());
            }
            "-p" => opts.profile = true,
            "-v" => opts.show_version = true,
            "--" => {
                i += 1;
                break;
            }
            "-" => {
                opts.read_stdin = true;
                return Ok(opts);
            }
            _ if arg.starts_with('-') => return Err(format!("unrecognized option '{arg}'")),
            _ => break,
        }
        i += 1;
    }

    if let Some(script) = args.get(i) {
        opts.script_file = Some(script.clone());
        opts.script_args = args[i + 1..].to_vec();
    }
    Ok(opts)
}

fn load_settings(opts: &Options) -> Result<VmSettings, String> {
    let mut settings = match &opts.settings_file {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("cannot open {path}: {e}"))?;
            VmSettings::from_json(&text).map_err(|e| format!("{path}: {e}"))?
        }
        // The command line runs plain source, so it defaults away from Ship.
        None => VmSettings {
            build_config: BuildConfig::Developer,
            ..Default::default()
        },
    };
    settings.name = "main".to_string();
    if let Some(config) = opts.build_config {
        settings.build_config = config;
    }
    if opts.profile {
        settings.enable_memory_profiling = true;
    }

    // The script's own directory is searched first.
    let script_dir = opts
        .script_file
        .as_deref()
        .and_then(|s| Path::new(s).parent())
        .map(|p| if p.as_os_str().is_empty() { PathBuf::from(".") } else { p.to_path_buf() });
    let mut base_paths: Vec<PathBuf> = script_dir.into_iter().collect();
    base_paths.extend(opts.include_paths.iter().cloned());
    base_paths.append(&mut settings.base_paths);
    settings.base_paths = base_paths;

    settings = settings
        .with_standard_output(|line| println!("{line}"))
        .with_error_handler(|state| eprintln!("luahost: {}", state.traceback));

    if let Some(host) = &opts.debugger {
        let client = if host.contains(':') {
            DebuggerClient::connect_to(host.clone())
        } else {
            DebuggerClient::connect(host)
        }
        .map_err(|e| format!("debugger: {e}"))?;
        // Give the server a moment so the first lines can already break.
        let deadline = Instant::now() + DEBUGGER_CONNECT_WAIT;
        while !client.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !client.is_connected() {
            eprintln!("luahost: no debugger at {}, running detached", client.address());
        }
        settings = settings.with_debugger(Arc::new(client));
    }
    Ok(settings)
}

fn set_arg_table(vm: &Vm, exe: &str, script: Option<&str>, args: &[String]) -> Result<(), ScriptError> {
    vm.with_lua(|lua| -> mlua::Result<()> {
        let table = lua.create_table()?;
        table.raw_set(-1, exe)?;
        if let Some(script) = script {
            table.raw_set(0, script)?;
        }
        for (i, a) in args.iter().enumerate() {
            table.raw_set(i as i64 + 1, a.as_str())?;
        }
        lua.globals().set("arg", table)
    })?
    .map_err(ScriptError::from)
}

fn run_stdin(vm: &Vm) -> Result<(), String> {
    let mut code = String::new();
    io::stdin()
        .read_to_string(&mut code)
        .map_err(|e| format!("error reading stdin: {e}"))?;
    vm.run_code(&code).map_err(|e| e.to_string())
}

fn print_profile(vm: &Vm) {
    let mut rows = vm.query_memory_profiling_data();
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    eprintln!("{:>12}  owner", "bytes");
    for (owner, bytes) in rows {
        eprintln!("{bytes:>12}  {owner}");
    }
}

fn run(args: &[String]) -> i32 {
    let opts = match parse_args(args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("luahost: {e}");
            print_usage();
            return 1;
        }
    };
    if opts.show_version {
        println!("{VERSION}");
        if opts.execute_strings.is_empty() && opts.script_file.is_none() && !opts.read_stdin {
            return 0;
        }
    }
    if opts.execute_strings.is_empty() && opts.script_file.is_none() && !opts.read_stdin {
        print_usage();
        return 1;
    }

    let settings = match load_settings(&opts) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("luahost: {e}");
            return 1;
        }
    };
    let vm = match Vm::new(settings) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("luahost: {e}");
            return 1;
        }
    };

    let exe = args.first().map(String::as_str).unwrap_or("luahost");
    if let Err(e) = set_arg_table(&vm, exe, opts.script_file.as_deref(), &opts.script_args) {
        eprintln!("luahost: {e}");
        return 1;
    }

    // Script errors were already reported through the error handler.
    for code in &opts.execute_strings {
        if vm.run_code(code).is_err() {
            return 1;
        }
    }
    if let Some(script) = &opts.script_file {
        let name = Path::new(script)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.clone());
        match vm.run_script(&name) {
            Ok(()) => {}
            Err(ScriptError::NotFound(_)) => {
                eprintln!("luahost: cannot open {script}");
                return 1;
            }
            Err(e @ ScriptError::Content(_)) => {
                eprintln!("luahost: {e}");
                return 1;
            }
            Err(_) => return 1,
        }
    } else if opts.read_stdin {
        if let Err(e) = run_stdin(&vm) {
            eprintln!("luahost: {e}");
            return 1;
        }
    }

    if opts.profile {
        print_profile(&vm);
    }
    vm.shutdown();
    0
}

fn main() {
    let args: Vec<String> = env::args().collect();
    std::process::exit(run(&args));
}
