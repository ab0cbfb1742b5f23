use std::io::Write;
use std::process::{Command, Output, Stdio};

use mathvm::ast::*;

fn mathvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mathvm"))
}

fn write_program(program: &Program) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    serde_json::to_writer(&mut file, program).expect("serialize program");
    file.flush().expect("flush program");
    file
}

fn run_with(program: &Program, args: &[&str]) -> Output {
    let file = write_program(program);
    mathvm()
        .arg(file.path())
        .args(args)
        .output()
        .expect("failed to run mathvm")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn sum_program() -> Program {
    Program::new(Block::new(vec![Stmt::print(vec![
        Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(2)),
        Expr::string(" "),
        Expr::binary(BinaryOp::Mul, Expr::double(1.5), Expr::int(3)),
        Expr::string("\n"),
    ])]))
}

fn counter_program() -> Program {
    Program::new(
        Block::new(vec![Stmt::store("x", StoreOp::Increment, Expr::int(1))]).with_var("x", VarType::Int),
    )
}

// --- Running ---

#[test]
fn runs_on_the_vm() {
    let out = run_with(&sum_program(), &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "3 4.5\n");
}

#[test]
fn interpret_flag_gives_same_output() {
    let out = run_with(&sum_program(), &["--interpret"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "3 4.5\n");
}

#[test]
fn reads_program_from_stdin() {
    let json = serde_json::to_string(&sum_program()).unwrap();
    let mut child = mathvm()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to run mathvm");
    child.stdin.take().unwrap().write_all(json.as_bytes()).unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "3 4.5\n");
}

// --- Program arguments ---

#[test]
fn vars_written_back_and_printed() {
    for mode in [&[][..], &["--interpret"][..]] {
        let mut args = vec!["--var", "x=41", "--print-vars"];
        args.extend_from_slice(mode);
        let out = run_with(&counter_program(), &args);
        assert!(out.status.success(), "stderr: {}", stderr(&out));
        assert_eq!(stdout(&out).trim(), "x = 42");
    }
}

#[test]
fn var_of_wrong_type_rejected() {
    let out = run_with(&counter_program(), &["--var", "x=hello"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("MVM-R004"), "stderr: {}", stderr(&out));
}

#[test]
fn malformed_var_is_a_usage_error() {
    let out = run_with(&counter_program(), &["--var", "novalue"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("NAME=VALUE"), "stderr: {}", stderr(&out));
}

// --- Diagnostics ---

#[test]
fn translation_error_points_at_source() {
    let mut program = Program::new(
        Block::new(vec![Stmt::assign(
            "x",
            Expr::binary(BinaryOp::Add, Expr::load("y").at(Span::new(11, 12)), Expr::int(1)),
        )])
        .with_var("x", VarType::Int),
    );
    program.source = Some("int x;\nx = y + 1;".to_string());
    let out = run_with(&program, &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[MVM-T001]"), "stderr: {err}");
    assert!(err.contains("--> 2:5"), "stderr: {err}");
    assert!(err.contains("x = y + 1;"), "stderr: {err}");
    assert!(!err.contains("\x1b["), "no color when stderr is not a terminal");
    assert!(stdout(&out).is_empty());
}

#[test]
fn runtime_error_as_json() {
    let program = Program::new(Block::new(vec![Stmt::print(vec![Expr::binary(
        BinaryOp::Div,
        Expr::int(1),
        Expr::int(0),
    )])]));
    let out = run_with(&program, &["--json"]);
    assert!(!out.status.success());
    let line = stderr(&out).lines().last().unwrap_or_default().to_string();
    let v: serde_json::Value = serde_json::from_str(&line).expect("JSON diagnostic");
    assert_eq!(v["severity"], "error");
    assert_eq!(v["code"], "MVM-R001");
    assert!(v["notes"][0].as_str().unwrap().contains("offset"));
}

#[test]
fn invalid_json_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{\"top\": 3}").unwrap();
    let out = mathvm().arg(file.path()).output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("not a valid program"), "stderr: {}", stderr(&out));
}

#[test]
fn missing_file_reported() {
    let out = mathvm().arg("/nonexistent/program.json").output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("cannot read"), "stderr: {}", stderr(&out));
}

// --- Explain ---

#[test]
fn explain_known_code() {
    let out = mathvm().args(["--explain", "MVM-R002"]).output().unwrap();
    assert!(out.status.success());
    assert!(stdout(&out).starts_with("## MVM-R002"));
}

#[test]
fn explain_unknown_code() {
    let out = mathvm().args(["--explain", "MVM-Z000"]).output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unknown error code"));
}
