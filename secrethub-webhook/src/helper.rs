#[derive(Debug, Default, Clone)]
pub struct CmdBuilder {
    buf: Vec<String>,
}

impl CmdBuilder {
    pub fn new(bin: impl ToString) -> Self {
        let buf = vec![bin.to_string()];
        Self { buf }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.buf.push(arg.to_string());
        self
    }

    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.buf.extend(args.into_iter().map(|arg| arg.to_string()));
        self
    }

    pub fn collect(self) -> Vec<String> {
        self.buf
    }
}
