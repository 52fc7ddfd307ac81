use std::env;
use std::fs;
use std::io::{self, Cursor, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};

use pickledbg::colors::*;
use pickledbg::disasm::{disassemble, DisasmLine};
use pickledbg::vm::{MachineOptions, PickleMachine, Step};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <picklefile>", args.first().map(String::as_str).unwrap_or("pickledbg"));
        return ExitCode::from(1);
    }
    match Debugger::open(&args[1]).and_then(|mut dbg| dbg.repl()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", redify(&format!("[!] Error: {err:#}")));
            ExitCode::from(1)
        }
    }
}

struct Debugger {
    pickle: Vec<u8>,
    listing: Vec<DisasmLine>,
    machine: Option<PickleMachine<Cursor<Vec<u8>>>>,
    options: MachineOptions,
    step_verbose: bool,
    /// Listing index of the next instruction to execute.
    line_no: usize,
    finished: bool,
    last_command: String,
}

impl Debugger {
    fn open(path: &str) -> Result<Debugger> {
        let pickle = fs::read(path).with_context(|| format!("could not open pickle file {path}"))?;
        let listing = disassemble(&pickle).context("could not disassemble pickle file")?;
        Ok(Debugger {
            pickle,
            listing,
            machine: None,
            options: MachineOptions::default(),
            step_verbose: true,
            line_no: 0,
            finished: false,
            last_command: String::new(),
        })
    }

    fn repl(&mut self) -> Result<()> {
        loop {
            print!("{}", greenify("pickledbg>  "));
            io::stdout().flush()?;
            let mut line = String::new();
            if io::stdin().read_line(&mut line)? == 0 {
                println!("{}", redify("\n[+] Exiting..."));
                return Ok(());
            }
            let mut input = line.trim().to_owned();
            if input.is_empty() {
                input = self.last_command.clone();
                if input.is_empty() {
                    continue;
                }
            }
            let words: Vec<&str> = input.split_whitespace().collect();
            match words.as_slice() {
                ["exit"] | ["quit"] => return Ok(()),
                ["start"] | ["run"] => self.cmd_start(),
                ["ni"] | ["next"] => self.cmd_step(1),
                ["step", n] => match n.parse::<usize>() {
                    Ok(n) if n > 0 => self.cmd_step(n),
                    _ => self.invalid("step takes a positive instruction count"),
                },
                ["step-to", addr] => match addr.parse::<u64>() {
                    Ok(addr) => self.cmd_step_to(addr),
                    Err(_) => self.invalid("step-to takes an instruction address"),
                },
                ["export"] => self.cmd_export("out.disasm"),
                ["export", file] => self.cmd_export(file),
                ["show", "options"] => self.cmd_show_options(),
                ["set", option, value] => self.cmd_set(option, value),
                ["help"] | ["?"] => self.cmd_help(),
                ["help", "options"] => self.cmd_help_options(),
                _ => {
                    println!(
                        "{}",
                        redify("[!] Invalid command. Type 'help' for a list of available commands.")
                    );
                    continue;
                }
            }
            self.last_command = input;
        }
    }

    fn invalid(&self, msg: &str) {
        println!("{}", redify(&format!("[!] {msg}")));
    }

    fn cmd_start(&mut self) {
        if self.machine.is_some() {
            println!(
                "{}",
                redify("[!] Debugger already started. You must exit and restart the program again.")
            );
            return;
        }
        let machine = match PickleMachine::new(Cursor::new(self.pickle.clone()), &self.options) {
            Ok(machine) => machine,
            Err(err) => {
                println!("{}", redify(&format!("[!] {err}")));
                return;
            }
        };
        self.machine = Some(machine);
        self.line_no = 0;
        self.finished = false;
        self.print_state();
    }

    fn cmd_step(&mut self, count: usize) {
        if self.machine.is_none() {
            println!(
                "{}",
                redify("[!] You must start the debugger first. Try using the 'start' command.")
            );
            return;
        }
        for i in 0..count {
            if self.finished {
                println!("{}", redify("[!] The machine has already halted."));
                return;
            }
            self.execute_one();
            if self.step_verbose || i == count - 1 {
                self.print_state();
            }
        }
    }

    fn cmd_step_to(&mut self, addr: u64) {
        if self.machine.is_none() {
            println!(
                "{}",
                redify("[!] You must start the debugger first. Try using the 'start' command.")
            );
            return;
        }
        if !self.listing.iter().any(|line| line.pos == addr) {
            println!("{}", redify(&format!("[!] No instruction at address {addr}.")));
            return;
        }
        while !self.finished {
            let next = self.listing.get(self.line_no).map(|line| line.pos);
            if next == Some(addr) {
                break;
            }
            self.execute_one();
        }
        self.print_state();
    }

    fn execute_one(&mut self) {
        let machine = self.machine.as_mut().expect("checked by callers");
        match machine.step() {
            Ok(Step::Continue) => self.line_no += 1,
            Ok(Step::Stopped(value)) => {
                self.line_no += 1;
                self.finished = true;
                println!("{}", greenify(&format!("[+] STOP: {value}")));
            }
            Err(err) => {
                self.finished = true;
                println!("{}", redify(&format!("[!] {err}")));
            }
        }
    }

    fn cmd_export(&mut self, filename: &str) {
        println!("Exporting disassembly to {filename}...");
        let text: String = self
            .listing
            .iter()
            .map(|line| format!("{}\n", line.text))
            .collect();
        if fs::write(filename, text).is_err() {
            println!("{}", redify("[!] Error: could not export pickle disassembly"));
        }
    }

    fn cmd_show_options(&self) {
        let started = self.machine.is_some();
        println!("{}: {}", blueify("encoding    "), self.options.encoding);
        println!("{}: {}", blueify("errors      "), self.options.errors);
        println!("{}: {}", blueify("fix-imports "), self.options.fix_imports);
        println!("{}: {}", blueify("step-verbose"), self.step_verbose);
        if started {
            println!("{}", grayify("(machine options are locked after 'start')"));
        }
    }

    fn cmd_set(&mut self, option: &str, value: &str) {
        let started = self.machine.is_some();
        match option {
            "step-verbose" => match value {
                "true" => self.step_verbose = true,
                "false" => self.step_verbose = false,
                _ => self.invalid("step-verbose must be 'true' or 'false'"),
            },
            "encoding" | "errors" | "fix-imports" if started => {
                self.invalid("machine options cannot change after 'start'");
            }
            "encoding" => self.options.encoding = value.to_owned(),
            "errors" => self.options.errors = value.to_owned(),
            "fix-imports" => match value {
                "true" => self.options.fix_imports = true,
                "false" => self.options.fix_imports = false,
                _ => self.invalid("fix-imports must be 'true' or 'false'"),
            },
            _ => self.invalid("unknown option; try 'help options'"),
        }
    }

    fn print_state(&self) {
        let Some(machine) = self.machine.as_ref() else {
            return;
        };
        // clear the visible screen, keep scrollback
        print!("\x1b[H\x1b[2J");
        let width = terminal_width();

        let title = " stack & memo ";
        println!(
            "{}{}{}",
            grayify(&"─".repeat(width.saturating_sub(title.len() + 3))),
            cyanify(title),
            grayify("───")
        );
        println!("{}: {}", blueify("stack     "), colorize_stack(machine.stack()));
        if !machine.metastack().is_empty() {
            let frames: Vec<String> = machine
                .metastack()
                .iter()
                .map(|frame| colorize_stack(frame))
                .collect();
            println!("{}: [{}]", blueify("metastack "), frames.join(", "));
        }
        let memo: Vec<String> = machine
            .memo()
            .iter()
            .map(|(idx, value)| format!("{idx}: {}", colorize_value(value)))
            .collect();
        println!("{}: {{{}}}", blueify("memo      "), memo.join(", "));

        let title = " disassembly ";
        println!(
            "{}{}{}",
            grayify(&"─".repeat(width.saturating_sub(title.len() + 3))),
            cyanify(title),
            grayify("───")
        );
        let start = self.line_no.saturating_sub(3);
        for line in &self.listing[start..self.line_no] {
            println!("   {}", grayify(&line.text));
        }
        match self.listing.get(self.line_no) {
            Some(line) => println!("{}", greenify(&format!("-> {}", line.text))),
            None => println!("{}", greenify("-> (end of stream)")),
        }
        let after = (self.line_no + 1).min(self.listing.len());
        let end = (self.line_no + 4).min(self.listing.len());
        for line in &self.listing[after..end] {
            println!("   {}", line.text);
        }
        println!("{}", grayify(&"─".repeat(width)));
    }

    fn cmd_help(&self) {
        let width = terminal_width();
        let title = " pickledbg help ";
        let side = width.saturating_sub(title.len()) / 2;
        println!("{}{}{}", grayify(&"─".repeat(side)), cyanify(title), grayify(&"─".repeat(side)));

        let rule = grayify(&"─".repeat(width));
        println!("{}", redify("start"));
        println!("Starts the debugger, pointing to the first instruction but not executing it. Must only be ran once. To restart debugging, close the program and run it again. Must also be run before stepping through instructions.");
        println!("{} run", yellowify("Aliases:"));
        println!();
        println!("{rule}");

        println!("{}", redify("ni"));
        println!("Executes the next instruction and shows the updated Pickle Machine state. Must be ran after 'start'.");
        println!("{} next", yellowify("Aliases:"));
        println!();
        println!("{rule}");

        println!("{}", redify("step"));
        println!("Executes the next given number of instructions and shows the updated Pickle Machine state.");
        println!("{} step <number>", yellowify("Syntax:"));
        println!();
        println!("{rule}");

        println!("{}", redify("step-to"));
        println!("Executes instructions until the instruction address is reached and shows the updated Pickle Machine state.");
        println!("{} step-to <address>", yellowify("Syntax:"));
        println!();
        println!("{rule}");

        println!("{}", redify("export"));
        println!("Writes the disassembly of the pickle to a file. If no filename is specified, the default is 'out.disasm'.");
        println!("{} export [filename]", yellowify("Syntax:"));
        println!();
        println!("{rule}");

        println!("{}", redify("show options"));
        println!("Shows the current options and their values.");
        println!();
        println!("{rule}");

        println!("{}", redify("set"));
        println!("Sets an option to a value.");
        println!("{} set <option> <value>", yellowify("Syntax:"));
        println!();
        println!("{rule}");

        println!("{}", redify("help"));
        println!("Shows this help menu. Type 'help options' for available options.");
        println!("{} ?", yellowify("Aliases:"));
        println!();
        println!("{rule}");

        println!("{}", redify("exit"));
        println!("Exits the debugger.");
        println!("{} quit", yellowify("Aliases:"));
        println!();
        println!("{rule}");
    }

    fn cmd_help_options(&self) {
        println!("{}", redify("encoding"));
        println!("How to decode legacy string opcodes; 'bytes' keeps them as byte strings. Default: ASCII.");
        println!();
        println!("{}", redify("errors"));
        println!("Decode error policy paired with 'encoding': strict, replace or ignore. Default: strict.");
        println!();
        println!("{}", redify("fix-imports"));
        println!("Remap Python 2 module and class names when the protocol is below 3. Default: true.");
        println!();
        println!("{}", redify("step-verbose"));
        println!("Print the machine state after every instruction during 'step <number>'. Default: true.");
    }
}

fn terminal_width() -> usize {
    env::var("COLUMNS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(80)
}
