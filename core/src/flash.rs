use std::fmt;
use std::path::Path;

use crate::command::{split_template, CommandLine};
use crate::error::{KilnError, Result};
use crate::metadata::BoardMetadata;
use crate::toolchain::{executable, Sandbox, Toolchain};

/// Fixed USB filter for the Arduino DFU bootloaders.
const DFU_DEVICE: &str = ",0x2341:0x0069,:0x0369";

const PARTITIONS_OFFSET: &str = "0x8000";
const BOOT_APP0_OFFSET: &str = "0xe000";
const APP_OFFSET: &str = "0x10000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Direct,
    Avrdude,
    Esptool,
    Bossac,
    DfuUtil,
}

impl ToolKind {
    /// Picks the flashing tool from the upload template's program token.
    pub fn detect(program: &str) -> Self {
        let name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let name = name.trim_end_matches(".exe").trim_end_matches(".py");

        match name {
            "avrdude" => ToolKind::Avrdude,
            "esptool" | "esptool_py" => ToolKind::Esptool,
            "bossac" => ToolKind::Bossac,
            "dfu-util" => ToolKind::DfuUtil,
            _ => ToolKind::Direct,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolKind::Direct => "direct",
            ToolKind::Avrdude => "avrdude",
            ToolKind::Esptool => "esptool",
            ToolKind::Bossac => "bossac",
            ToolKind::DfuUtil => "dfu-util",
        };
        write!(f, "{}", name)
    }
}

/// Everything a recipe needs to turn into a concrete command.
pub struct FlashTarget<'a> {
    pub port: &'a str,
    pub baud: u32,
    pub sandbox: &'a Sandbox,
    pub toolchain: &'a Toolchain,
    pub board: &'a BoardMetadata,
}

impl FlashTarget<'_> {
    fn substitute(&self, arg: &str) -> String {
        arg.replace("${serial}", self.port)
            .replace("${baud}", &self.baud.to_string())
            .replace("${build}", &display(&self.sandbox.build_dir()))
            .replace("${sdk}", &display(&self.toolchain.sdk))
            .replace("${tools}", &display(&self.toolchain.tools_dir()))
            .replace("${compiler}", &display(&self.toolchain.compiler_dir))
    }

    fn substitute_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|a| self.substitute(a)).collect()
    }
}

/// Parsed upload template, one variant per flashing tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashRecipe {
    Direct { program: String, args: Vec<String> },
    Avrdude { tool: String, args: Vec<String> },
    Esptool { tool: String, chip: String, args: Vec<String> },
    Bossac { tool: String, touch: bool, args: Vec<String> },
    DfuUtil { tool: String, args: Vec<String> },
}

impl FlashRecipe {
    pub fn from_template(template: &str, board: &BoardMetadata) -> Result<Self> {
        let mut tokens = split_template(template).into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| KilnError::config("missing upload command"))?;
        let args: Vec<String> = tokens.collect();

        let recipe = match ToolKind::detect(&program) {
            ToolKind::Direct => FlashRecipe::Direct { program, args },
            ToolKind::Avrdude => FlashRecipe::Avrdude { tool: program, args },
            ToolKind::Esptool => {
                let chip = chip_of(&args)
                    .ok_or_else(|| KilnError::config("missing --chip in upload command"))?;
                FlashRecipe::Esptool {
                    tool: program,
                    chip,
                    args,
                }
            }
            ToolKind::Bossac => FlashRecipe::Bossac {
                tool: program,
                touch: board.use_1200bps_touch,
                args,
            },
            ToolKind::DfuUtil => FlashRecipe::DfuUtil { tool: program, args },
        };

        Ok(recipe)
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            FlashRecipe::Direct { .. } => ToolKind::Direct,
            FlashRecipe::Avrdude { .. } => ToolKind::Avrdude,
            FlashRecipe::Esptool { .. } => ToolKind::Esptool,
            FlashRecipe::Bossac { .. } => ToolKind::Bossac,
            FlashRecipe::DfuUtil { .. } => ToolKind::DfuUtil,
        }
    }

    /// Whether the port needs a 1200-baud open/close before flashing.
    pub fn needs_touch(&self) -> bool {
        matches!(self, FlashRecipe::Bossac { touch: true, .. })
    }

    pub fn command_line(&self, target: &FlashTarget<'_>) -> Result<CommandLine> {
        let sandbox = target.sandbox;

        let command = match self {
            FlashRecipe::Direct { program, args } => {
                CommandLine::new(target.substitute(program)).args(target.substitute_all(args))
            }
            FlashRecipe::Avrdude { tool, args } => {
                let dir = target.toolchain.tool_dir(target.board, tool)?;
                let conf = format!("-C{}", display(&dir.join("avrdude.conf")));
                let mut args: Vec<String> = target
                    .substitute_all(args)
                    .into_iter()
                    .filter(|a| !a.starts_with("-C"))
                    .collect();
                args.insert(0, conf);

                CommandLine::new(display(&dir.join(executable(tool))))
                    .args(args)
                    .arg("-P")
                    .arg(target.port)
                    .arg("-b")
                    .arg(target.baud.to_string())
                    .arg("-D")
                    .arg(format!("-Uflash:w:{}:i", display(&sandbox.artifact("hex"))))
            }
            FlashRecipe::Esptool { tool, chip, args } => {
                let binary = target.toolchain.tool_binary(target.board, tool)?;
                let boot_app0 = target
                    .toolchain
                    .sdk
                    .join("tools")
                    .join("partitions")
                    .join("boot_app0.bin");

                CommandLine::new(display(&binary))
                    .args(target.substitute_all(args))
                    .arg("--port")
                    .arg(target.port)
                    .arg("--baud")
                    .arg(target.baud.to_string())
                    .arg("write_flash")
                    .arg(bootloader_offset(chip))
                    .path_arg(&sandbox.artifact("bootloader.bin"))
                    .arg(PARTITIONS_OFFSET)
                    .path_arg(&sandbox.artifact("partitions.bin"))
                    .arg(BOOT_APP0_OFFSET)
                    .path_arg(&boot_app0)
                    .arg(APP_OFFSET)
                    .path_arg(&sandbox.artifact("bin"))
            }
            FlashRecipe::Bossac { tool, args, .. } => {
                let binary = target.toolchain.tool_binary(target.board, tool)?;
                CommandLine::new(display(&binary))
                    .args(target.substitute_all(args))
                    .arg(format!("--port={}", target.port))
                    .args(["-U", "-i", "-e", "-w"])
                    .path_arg(&sandbox.artifact("bin"))
                    .arg("-R")
            }
            FlashRecipe::DfuUtil { tool, args } => {
                let binary = target.toolchain.tool_binary(target.board, tool)?;
                CommandLine::new(display(&binary))
                    .args(target.substitute_all(args))
                    .arg("-d")
                    .arg(DFU_DEVICE)
                    .args(["-a", "0", "-Q", "-D"])
                    .path_arg(&sandbox.artifact("bin"))
            }
        };

        Ok(command)
    }
}

fn chip_of(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--chip" || arg == "-c" {
            return iter.next().cloned().filter(|c| !c.is_empty());
        }
        if let Some(chip) = arg.strip_prefix("--chip=") {
            return Some(chip.to_string()).filter(|c| !c.is_empty());
        }
    }
    None
}

fn bootloader_offset(chip: &str) -> &'static str {
    match chip.to_lowercase().as_str() {
        "esp32" | "esp32s2" => "0x1000",
        _ => "0x0",
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
