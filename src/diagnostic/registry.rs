/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str, // one line, shown in listings
    pub long: &'static str,  // full explanation for --explain
}

/// All stable error codes reported by translation and execution.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Translation ──────────────────────────────────────────────────────────
    ErrorEntry {
        code: "MVM-T001",
        short: "undefined variable",
        long: r#"## MVM-T001: undefined variable

A name was loaded or stored that is not declared in the current block,
any enclosing block, or any enclosing function.

**Example:**

    int x;
    x = y + 1;   // y is never declared

Declare the variable in the block that uses it or in an enclosing one.
Variables of a sibling function are never visible.
"#,
    },
    ErrorEntry {
        code: "MVM-T002",
        short: "undefined function",
        long: r#"## MVM-T002: undefined function

A call names a function that is not declared in the current block or
any enclosing block. Functions declared inside another function are
only visible within that function's body.
"#,
    },
    ErrorEntry {
        code: "MVM-T003",
        short: "wrong number of arguments",
        long: r#"## MVM-T003: wrong number of arguments

A call passes a different number of arguments than the function
declares parameters. There are no default or variadic parameters.
"#,
    },
    ErrorEntry {
        code: "MVM-T004",
        short: "incompatible types",
        long: r#"## MVM-T004: incompatible types

A value cannot be converted to the type its destination requires.
Ints and doubles convert into each other implicitly (doubles truncate
toward zero). A string stored into an int becomes 1 when non-empty and 0
when empty. Nothing converts to a string, and strings never convert to
doubles.

**Example:**

    string s;
    s = 7;
"#,
    },
    ErrorEntry {
        code: "MVM-T005",
        short: "operator not applicable to operand type",
        long: r#"## MVM-T005: operator not applicable to operand type

Arithmetic and comparison operators take ints and doubles. `%`, `|`,
`&` and `^` take ints only. Strings may appear only in conditions,
`!`, `&&`, `||`, assignments, arguments, return values and `print`.
"#,
    },
    ErrorEntry {
        code: "MVM-T006",
        short: "void used as a value",
        long: r#"## MVM-T006: void used as a value

The result of a void function was used inside an expression, or a
variable was declared with type void. Calls to void functions may only
stand alone as statements.
"#,
    },
    ErrorEntry {
        code: "MVM-T007",
        short: "duplicate declaration",
        long: r#"## MVM-T007: duplicate declaration

Two variables, or two functions, with the same name were declared in
the same block. An inner block may shadow an outer name.
"#,
    },
    ErrorEntry {
        code: "MVM-T008",
        short: "for loop variable is not an int",
        long: r#"## MVM-T008: for loop variable is not an int

`for (i in a..b)` counts with an int variable. Declare `i` as int; the
bounds may be doubles and are truncated.
"#,
    },
    ErrorEntry {
        code: "MVM-T009",
        short: "return does not match the function's type",
        long: r#"## MVM-T009: return does not match the function's type

A non-void function used `return;` without a value, or a void function
returned a value.
"#,
    },
    ErrorEntry {
        code: "MVM-T010",
        short: "invalid native function",
        long: r#"## MVM-T010: invalid native function

A `native 'symbol';` body could not be turned into a callable function.
Causes:

- the statement is not the only statement of the function body
- the symbol is not exported by the running process
- the signature needs more than 6 int/string or more than 8 double
  parameters, or declares a void parameter
- the host is not x86-64 or AArch64 (or is Windows)
"#,
    },
    ErrorEntry {
        code: "MVM-T011",
        short: "program exceeds a table limit",
        long: r#"## MVM-T011: program exceeds a table limit

Function ids, local slots per function and string constant ids are
16-bit. A program needing more than 65535 of any of them cannot be
translated.
"#,
    },
    ErrorEntry {
        code: "MVM-T012",
        short: "internal label error",
        long: r#"## MVM-T012: internal label error

A branch target was bound twice, never bound, or lies further than a
16-bit offset can reach. The last case happens for a loop or `if` body
larger than about 32 KiB of bytecode; split it into functions.
Otherwise this is a translator bug.
"#,
    },

    // ── Execution ────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "MVM-R001",
        short: "division by zero",
        long: r#"## MVM-R001: division by zero

An int `/` or `%` had a zero divisor. Double division follows IEEE-754
and yields an infinity or NaN instead.
"#,
    },
    ErrorEntry {
        code: "MVM-R002",
        short: "no live frame for an enclosing function",
        long: r#"## MVM-R002: no live frame for an enclosing function

A nested function accessed a variable of an enclosing function while
no invocation of that enclosing function was active. Access resolves
to the most recent active invocation of the owner.
"#,
    },
    ErrorEntry {
        code: "MVM-R003",
        short: "call depth exceeded",
        long: r#"## MVM-R003: call depth exceeded

Calls nested deeper than the limit. This is almost always recursion
without a reachable base case.
"#,
    },
    ErrorEntry {
        code: "MVM-R004",
        short: "program argument has the wrong type",
        long: r#"## MVM-R004: program argument has the wrong type

A value passed with `--var NAME=VALUE` does not match the declared
type of the top-level variable NAME. Values are parsed as int, then
double, then taken as a string.
"#,
    },
    ErrorEntry {
        code: "MVM-R005",
        short: "native call failed",
        long: r#"## MVM-R005: native call failed

A call to a native function could not be made: the symbol could not be
resolved, the arguments did not match the signature, or a string
argument contained a NUL byte.
"#,
    },
    ErrorEntry {
        code: "MVM-R006",
        short: "output failed",
        long: r#"## MVM-R006: output failed

Writing `print` output failed, for example because stdout was closed.
"#,
    },
    ErrorEntry {
        code: "MVM-R007",
        short: "operand stack fault",
        long: r#"## MVM-R007: operand stack fault

An instruction found too few values on the operand stack, or a value
of the wrong type. Bytecode from the translator never does this; the
program was built by hand or the translator has a bug.
"#,
    },
    ErrorEntry {
        code: "MVM-R008",
        short: "malformed bytecode",
        long: r#"## MVM-R008: malformed bytecode

The VM met an unknown opcode, a truncated instruction, a branch or
slot out of range, an unknown function, native or string id, or ran
past the end of a function. This indicates a translator bug or
hand-built bytecode.
"#,
    },
    ErrorEntry {
        code: "MVM-R009",
        short: "reference interpreter rejected the program",
        long: r#"## MVM-R009: reference interpreter rejected the program

`--interpret` met a construct the translator would have rejected, such
as an undefined name or an operand of the wrong type.
"#,
    },
];

/// Look up an error entry by code (e.g. `"MVM-T004"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}
