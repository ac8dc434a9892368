//! The three scripts a capture produces: a plain command list
//! (`script.txt`) and equivalent POSIX shell and Windows batch flashers.

#[derive(Debug, Default, Clone)]
pub struct ScriptWriter {
    script: String,
    sh: String,
    bat: String,
}

impl ScriptWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn sh(&self) -> &str {
        &self.sh
    }

    pub fn bat(&self) -> &str {
        &self.bat
    }

    pub fn add_command(&mut self, cmd: &str) {
        self.script.push_str(cmd);
        self.script.push('\n');
    }

    pub fn add_comment(&mut self, comment: &str) {
        self.script.push_str("# ");
        self.script.push_str(comment);
        self.script.push('\n');
        self.add_sh_bat_comment(comment);
    }

    pub fn add_sh_line(&mut self, line: &str) {
        self.sh.push_str(line);
        self.sh.push('\n');
    }

    pub fn add_bat_line(&mut self, line: &str) {
        self.bat.push_str(line);
        self.bat.push('\n');
    }

    pub fn add_sh_bat_line(&mut self, line: &str) {
        self.add_sh_line(line);
        self.add_bat_line(line);
    }

    /// A command line for both flashers; the batch one bails out on error.
    pub fn add_sh_bat_command(&mut self, cmd: &str) {
        self.add_sh_line(cmd);
        self.add_bat_line(cmd);
        self.add_bat_line("if %errorlevel% neq 0 call:pakExit\n");
    }

    pub fn add_sh_bat_comment(&mut self, comment: &str) {
        self.sh.push_str("# ");
        self.sh.push_str(comment);
        self.sh.push('\n');
        self.bat.push_str(":: ");
        self.bat.push_str(comment);
        self.bat.push('\n');
    }

    /// Asserts that a device variable has the value the capture assumed.
    pub fn add_check_var(&mut self, name: &str, expected: &str) {
        self.add_command(&format!("check-var {name} {expected}"));

        let var: String = name.chars().filter(|c| *c != '_' && *c != '-').collect();
        let mismatch = |value: &str| {
            if name == "product" {
                format!(
                    "  echo Error: this factory image is for {expected}, but the name of connected device is {value}"
                )
            } else {
                format!("  echo Error: unexpected value of {name} variable: expected {expected}, got {value}")
            }
        };

        self.add_sh_line(&format!(
            "{var}=$(fastboot getvar {name} 2>&1 | grep \"{name}:\" | cut -d ' ' -f 2)\nif ! [ ${var} = \"{expected}\" ]; then"
        ));
        self.add_sh_line(&mismatch(&format!("${var}")));
        self.add_sh_line("  exit 1\nfi");

        self.add_bat_line(&format!(
            "for /f \"tokens=2\" %%a in ('fastboot getvar {name} 2^>^&1 ^| find \"{name}:\"') do (\n  set \"{var}=%%a\"\n)\nif not \"%{var}%\" == \"{expected}\" ("
        ));
        self.add_bat_line(&mismatch(&format!("%{var}%")));
        self.add_bat_line("  call:pakExit\n)");
    }

    /// Closes the batch script with the exit label its error checks jump to.
    pub fn finish_bat(&mut self) {
        self.add_bat_line(":pakExit\necho Press any key to exit...\npause >nul\nexit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_var_in_both_dialects() {
        let mut w = ScriptWriter::new();
        w.add_check_var("slot-count", "2");
        assert_eq!(w.script(), "check-var slot-count 2\n");
        assert!(w.sh().starts_with("slotcount=$(fastboot getvar slot-count 2>&1"));
        assert!(w.sh().contains("if ! [ $slotcount = \"2\" ]; then"));
        assert!(w.sh().contains("expected 2, got $slotcount"));
        assert!(w.bat().contains("if not \"%slotcount%\" == \"2\" ("));
        assert!(w.bat().contains("  call:pakExit\n)"));
    }

    #[test]
    fn comments_and_commands() {
        let mut w = ScriptWriter::new();
        w.add_comment("hello");
        w.add_sh_bat_command("fastboot erase misc");
        assert_eq!(w.script(), "# hello\n");
        assert_eq!(w.sh(), "# hello\nfastboot erase misc\n");
        assert_eq!(
            w.bat(),
            ":: hello\nfastboot erase misc\nif %errorlevel% neq 0 call:pakExit\n\n"
        );
    }
}
